//! Extraction of the header fields the pipeline needs from received datasets.
use crate::error::MissingRequiredTag;
use crate::metadata_bag::MetadataBag;
use crate::task_store::InstanceRecord;
use camino::Utf8Path;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};

/// GE private tags carrying iteration/subset/filter settings.
pub(crate) const GE_ITERATIONS: Tag = Tag(0x0009, 0x10B2);
pub(crate) const GE_SUBSETS: Tag = Tag(0x0009, 0x10B3);
pub(crate) const GE_IS_FILTERED: Tag = Tag(0x0009, 0x10BA);
pub(crate) const GE_FILTER_FWHM: Tag = Tag(0x0009, 0x10BB);
pub(crate) const GE_FILTER_TYPE: Tag = Tag(0x0009, 0x10DC);
/// UIH nests its reconstruction parameters two sequences deep.
pub(crate) const UIH_RECON_SEQUENCE: Tag = Tag(0x0067, 0x1021);
pub(crate) const UIH_ALGORITHM_SEQUENCE: Tag = Tag(0x0018, 0x9749);
pub(crate) const UIH_ITERATIONS: Tag = Tag(0x0018, 0x9739);
pub(crate) const UIH_SUBSETS: Tag = Tag(0x0018, 0x9740);

/// Vendor-specific and standard tags retained as a task's recon settings.
const RECON_TAGS: &[Tag] = &[
    tags::PIXEL_SPACING,
    tags::RECONSTRUCTION_METHOD,
    tags::MANUFACTURER,
    tags::MANUFACTURER_MODEL_NAME,
    tags::SLICE_THICKNESS,
    tags::CONVOLUTION_KERNEL,
    tags::PATIENT_WEIGHT,
    tags::ACTUAL_FRAME_DURATION,
    tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
    GE_ITERATIONS,
    GE_SUBSETS,
    GE_IS_FILTERED,
    GE_FILTER_FWHM,
    GE_FILTER_TYPE,
    UIH_RECON_SEQUENCE,
];

/// The mandatory fields of §receive: an instance missing any of these is
/// refused with 0xA700.
#[derive(Debug, Clone)]
pub(crate) struct EssentialFields {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub z_position: f64,
    pub number_of_slices: Option<i64>,
}

pub(crate) fn extract_essential(
    obj: &DefaultDicomObject,
) -> Result<EssentialFields, MissingRequiredTag> {
    let position = obj
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()
        .and_then(|e| e.to_multi_float64().ok())
        .filter(|v| v.len() >= 3)
        .ok_or(MissingRequiredTag("ImagePositionPatient"))?;
    Ok(EssentialFields {
        study_uid: ttr(obj, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
        series_uid: ttr(obj, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
        sop_uid: ttr(obj, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        z_position: position[2],
        number_of_slices: obj
            .element(tags::NUMBER_OF_SLICES)
            .ok()
            .and_then(|e| e.to_int::<i64>().ok()),
    })
}

/// The recon-settings bag of one instance, vendor tags included.
pub(crate) fn extract_recon(obj: &DefaultDicomObject) -> MetadataBag {
    MetadataBag::from_object_tags(obj, RECON_TAGS)
}

/// Row metadata for the entity upserts, with the storage path laid out as
/// `{root}/{StudyUID}/{SeriesUID}/{SOPUID}`.
pub(crate) fn instance_record(
    obj: &DefaultDicomObject,
    incoming_root: &Utf8Path,
) -> Result<InstanceRecord, MissingRequiredTag> {
    let essential = extract_essential(obj)?;
    let sop_class_uid = ttr(obj, tags::SOP_CLASS_UID, "SOPClassUID")?;
    let patient_id = ttr(obj, tags::PATIENT_ID, "PatientID")?;
    let study_dir = incoming_root.join(&essential.study_uid);
    let series_dir = study_dir.join(&essential.series_uid);
    let filename = series_dir.join(&essential.sop_uid);
    Ok(InstanceRecord {
        sop_uid: essential.sop_uid,
        sop_class_uid,
        filename,
        patient_id,
        patient_name: tts(obj, tags::PATIENT_NAME),
        study_uid: essential.study_uid,
        study_date: dicom_datetime(obj, tags::STUDY_DATE, tags::STUDY_TIME),
        study_description: tts(obj, tags::STUDY_DESCRIPTION),
        patient_weight: ttf(obj, tags::PATIENT_WEIGHT),
        patient_size: ttf(obj, tags::PATIENT_SIZE),
        patient_age: tts(obj, tags::PATIENT_AGE),
        series_uid: essential.series_uid,
        series_date: dicom_datetime(obj, tags::SERIES_DATE, tags::SERIES_TIME),
        series_description: tts(obj, tags::SERIES_DESCRIPTION),
        modality: tts(obj, tags::MODALITY),
        series_number: obj
            .element(tags::SERIES_NUMBER)
            .ok()
            .and_then(|e| e.to_int::<i64>().ok()),
        study_dir,
        series_dir,
    })
}

/// Required string tag
fn ttr(
    obj: &DefaultDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<String, MissingRequiredTag> {
    tt(obj, tag)
        .map(|s| s.to_string())
        .ok_or(MissingRequiredTag(name))
}

/// Optional string tag
fn tts(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    tt(obj, tag).map(|s| s.to_string())
}

/// Optional float tag
fn ttf(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok().and_then(|e| e.to_float64().ok())
}

/// Try to get the trimmed string value of a DICOM object.
fn tt(obj: &DefaultDicomObject, tag: Tag) -> Option<&str> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.string().map(|s| s.trim_end_matches(['\0', ' '])).ok())
        .filter(|s| !s.is_empty())
}

/// Combine DICOM DA + TM tags into a UTC timestamp. The fractional part of
/// the time is ignored, as are values which do not parse.
fn dicom_datetime(obj: &DefaultDicomObject, date_tag: Tag, time_tag: Tag) -> Option<OffsetDateTime> {
    let date = tt(obj, date_tag)?;
    let time = tt(obj, time_tag).unwrap_or("000000");
    parse_dicom_datetime(date, time)
}

pub(crate) fn parse_dicom_datetime(date: &str, time: &str) -> Option<OffsetDateTime> {
    let date_format = format_description!("[year][month][day]");
    let time_format = format_description!("[hour][minute][second]");
    let date = Date::parse(date.trim(), &date_format).ok()?;
    let hms = time.trim().split('.').next().unwrap_or("000000");
    let time = Time::parse(hms, &time_format).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_parse_dicom_datetime() {
        assert_eq!(
            parse_dicom_datetime("20240305", "143059.123"),
            Some(datetime!(2024-03-05 14:30:59 UTC))
        );
        assert_eq!(
            parse_dicom_datetime("20240305", "143059"),
            Some(datetime!(2024-03-05 14:30:59 UTC))
        );
        assert_eq!(parse_dicom_datetime("bogus", "143059"), None);
    }
}
