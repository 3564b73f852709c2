//! Synthetic PET instances for tests.
use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};

pub(crate) struct SyntheticSlice<'a> {
    pub sop_uid: &'a str,
    pub series_uid: &'a str,
    pub study_uid: &'a str,
    pub z: f64,
    pub rows: u16,
    pub columns: u16,
    /// Stored pixel values, row-major.
    pub pixels: Vec<u16>,
    pub rescale_slope: f64,
}

/// A decodable PET Image Storage instance with the headers the pipeline
/// reads: geometry, rescale, recon settings and the radiopharmaceutical
/// sequence (SIEMENS flavor).
pub(crate) fn synthetic_pet_slice(spec: SyntheticSlice) -> DefaultDicomObject {
    let mut bytes = Vec::with_capacity(spec.pixels.len() * 2);
    for value in &spec.pixels {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let rf_item = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::RADIOPHARMACEUTICAL,
            VR::LO,
            PrimitiveValue::from("Fluorodeoxyglucose"),
        ),
        DataElement::new(
            tags::RADIONUCLIDE_HALF_LIFE,
            VR::DS,
            PrimitiveValue::from("6586.2"),
        ),
        DataElement::new(
            tags::RADIONUCLIDE_TOTAL_DOSE,
            VR::DS,
            PrimitiveValue::from("370000000"),
        ),
        DataElement::new(
            tags::RADIOPHARMACEUTICAL_START_TIME,
            VR::TM,
            PrimitiveValue::from("083000"),
        ),
    ]);
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(spec.sop_uid)),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.series_uid),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(spec.study_uid),
        ),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("PAT-1")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")),
        DataElement::new(tags::PATIENT_WEIGHT, VR::DS, PrimitiveValue::from("81.4")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("PT")),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, PrimitiveValue::from("AC PET")),
        DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("3")),
        DataElement::new(tags::MANUFACTURER, VR::LO, PrimitiveValue::from("SIEMENS")),
        DataElement::new(
            tags::MANUFACTURER_MODEL_NAME,
            VR::LO,
            PrimitiveValue::from("Biograph128"),
        ),
        DataElement::new(
            tags::RECONSTRUCTION_METHOD,
            VR::LO,
            PrimitiveValue::from("3i21s BSREM"),
        ),
        DataElement::new(
            tags::CONVOLUTION_KERNEL,
            VR::SH,
            PrimitiveValue::from("XYZ Gauss5.00"),
        ),
        DataElement::new(
            tags::ACTUAL_FRAME_DURATION,
            VR::IS,
            PrimitiveValue::from("90000"),
        ),
        DataElement::new(
            tags::NUMBER_OF_SLICES,
            VR::US,
            PrimitiveValue::from(3_u16),
        ),
        DataElement::new(
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            VR::SQ,
            DataSetSequence::from(vec![rf_item]),
        ),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::Strs(vec!["0".to_string(), "0".to_string(), spec.z.to_string()].into()),
        ),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, PrimitiveValue::from("3.65\\3.65")),
        DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("3.27")),
        DataElement::new(
            tags::RESCALE_SLOPE,
            VR::DS,
            PrimitiveValue::from(spec.rescale_slope.to_string()),
        ),
        DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from("0")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(spec.rows)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(spec.columns)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(
            tags::PIXEL_REPRESENTATION,
            VR::US,
            PrimitiveValue::from(0_u16),
        ),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(bytes)),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(spec.sop_uid)
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .expect("synthetic meta always builds");
    obj.with_exact_meta(meta)
}
