//! Vendor-specific reconstruction-metadata handling.
//!
//! Each manufacturer encodes iteration/subset counts and the
//! radiopharmaceutical differently; the validate stage normalizes them
//! through these functions before talking to the remote server.
use crate::extract::{
    GE_FILTER_FWHM, GE_FILTER_TYPE, GE_IS_FILTERED, GE_ITERATIONS, GE_SUBSETS,
    UIH_ALGORITHM_SEQUENCE, UIH_ITERATIONS, UIH_RECON_SEQUENCE, UIH_SUBSETS,
};
use crate::metadata_bag::MetadataBag;
use dicom::dictionary_std::tags;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Manufacturer {
    Siemens,
    GeMedicalSystems,
    Cps,
    Mediso,
    Uih,
    Philips,
}

impl Manufacturer {
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "SIEMENS" => Some(Manufacturer::Siemens),
            "GE MEDICAL SYSTEMS" => Some(Manufacturer::GeMedicalSystems),
            "CPS" => Some(Manufacturer::Cps),
            "Mediso" => Some(Manufacturer::Mediso),
            "UIH" => Some(Manufacturer::Uih),
            "Philips" | "Philips Medical Systems" => Some(Manufacturer::Philips),
            _ => None,
        }
    }
}

/// A header problem the operator can act on.
#[derive(thiserror::Error, Debug, PartialEq)]
#[error("{0}")]
pub(crate) struct HeaderIssue(pub String);

/// Check that the recon settings carry everything the remote server needs,
/// patching vendor quirks in place:
///
/// - CPS and Mediso name the radiopharmaceutical only in the radionuclide
///   code sequence, so `Radiopharmaceutical` is filled from `CodeMeaning`.
/// - Mediso carries the applied post-filter FWHM inside
///   `ReconstructionMethod`; it is copied into `ConvolutionKernel`.
///
/// Returns whether the bag was modified.
pub(crate) fn check_header(bag: &mut MetadataBag) -> Result<bool, HeaderIssue> {
    for (tag, name) in [
        (tags::PIXEL_SPACING, "PixelSpacing"),
        (tags::SLICE_THICKNESS, "SliceThickness"),
        (tags::MANUFACTURER, "Manufacturer"),
        (
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            "RadiopharmaceuticalInformationSequence",
        ),
    ] {
        if !bag.contains(tag) {
            return Err(HeaderIssue(format!("{name} is not available")));
        }
    }

    let label = bag.str_of(tags::MANUFACTURER).unwrap_or_default().to_string();
    let manufacturer = Manufacturer::parse(&label)
        .ok_or_else(|| HeaderIssue(format!("manufacturer {label} is not supported")))?;

    let mut patched = false;
    match manufacturer {
        Manufacturer::Siemens => {
            require_radiopharmaceutical(bag, "SIEMENS")?;
            require(bag, tags::CONVOLUTION_KERNEL, "ConvolutionKernel", "SIEMENS")?;
            require(bag, tags::RECONSTRUCTION_METHOD, "ReconstructionMethod", "SIEMENS")?;
        }
        Manufacturer::GeMedicalSystems => {
            require_radiopharmaceutical(bag, "GE MEDICAL SYSTEMS")?;
            for (tag, name) in [
                (GE_ITERATIONS, "0009,10B2"),
                (GE_SUBSETS, "0009,10B3"),
                (GE_IS_FILTERED, "0009,10BA"),
            ] {
                require(bag, tag, name, "GE MEDICAL SYSTEMS")?;
            }
            if bag.int_of(GE_IS_FILTERED).unwrap_or(0) != 0 {
                require(bag, GE_FILTER_FWHM, "0009,10BB", "filtered GE MEDICAL SYSTEMS")?;
                require(bag, GE_FILTER_TYPE, "0009,10DC", "filtered GE MEDICAL SYSTEMS")?;
            }
        }
        Manufacturer::Cps | Manufacturer::Mediso => {
            patch_radiopharmaceutical_from_radionuclide(bag, &label)?;
            patched = true;
            require(bag, tags::RECONSTRUCTION_METHOD, "ReconstructionMethod", &label)?;
            if manufacturer == Manufacturer::Mediso {
                let method = bag
                    .str_of(tags::RECONSTRUCTION_METHOD)
                    .unwrap_or_default()
                    .to_string();
                let fwhm = mediso_postfilter_fwhm(&method).ok_or_else(|| {
                    HeaderIssue(format!(
                        "could not read the Mediso post-filter from ReconstructionMethod \"{method}\""
                    ))
                })?;
                bag.set_f64(tags::CONVOLUTION_KERNEL, fwhm);
            } else {
                require(bag, tags::CONVOLUTION_KERNEL, "ConvolutionKernel", &label)?;
            }
        }
        Manufacturer::Uih => {
            // iteration/subset extraction doubles as the presence check
            iterations_subsets_uih(bag).map_err(HeaderIssue)?;
        }
        Manufacturer::Philips => {}
    }
    Ok(patched)
}

/// Iterations and subsets of the reconstruction, per vendor encoding.
pub(crate) fn iterations_subsets(bag: &MetadataBag) -> Result<(i64, i64), String> {
    let label = bag.str_of(tags::MANUFACTURER).unwrap_or_default();
    let manufacturer = Manufacturer::parse(label)
        .ok_or_else(|| format!("manufacturer {label} is not supported"))?;
    match manufacturer {
        Manufacturer::Siemens | Manufacturer::Cps => {
            let method = bag.str_of(tags::RECONSTRUCTION_METHOD).unwrap_or_default();
            parse_i_s(method, siemens_regex()).ok_or_else(|| {
                format!("no iterations/subsets found in ReconstructionMethod \"{method}\"")
            })
        }
        Manufacturer::Mediso => {
            let method = bag.str_of(tags::RECONSTRUCTION_METHOD).unwrap_or_default();
            parse_i_s(method, mediso_regex()).ok_or_else(|| {
                format!("no iterations/subsets found in ReconstructionMethod \"{method}\"")
            })
        }
        Manufacturer::GeMedicalSystems => {
            let iterations = bag
                .int_of(GE_ITERATIONS)
                .ok_or("GE iteration tag 0009,10B2 is not readable")?;
            let subsets = bag
                .int_of(GE_SUBSETS)
                .ok_or("GE subset tag 0009,10B3 is not readable")?;
            Ok((iterations, subsets))
        }
        Manufacturer::Uih => iterations_subsets_uih(bag),
        Manufacturer::Philips => Ok((0, 0)),
    }
}

fn iterations_subsets_uih(bag: &MetadataBag) -> Result<(i64, i64), String> {
    let algorithm = bag
        .item(UIH_RECON_SEQUENCE, 0)
        .and_then(|recon| recon.item(UIH_ALGORITHM_SEQUENCE, 0))
        .ok_or("UIH reconstruction sequence 0067,1021 is missing or empty")?;
    let iterations = algorithm
        .int_of(UIH_ITERATIONS)
        .ok_or("UIH iteration tag 0018,9739 is missing")?;
    let subsets = algorithm
        .int_of(UIH_SUBSETS)
        .ok_or("UIH subset tag 0018,9740 is missing")?;
    Ok((iterations, subsets))
}

/// Post-filter FWHM in mm from a Mediso ReconstructionMethod, e.g.
/// `"OSEM i2s12 @ 4.2 mm,"`.
pub(crate) fn mediso_postfilter_fwhm(method: &str) -> Option<f64> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"@\s*(\d*\.?\d+)\s*m{0,2},").unwrap());
    re.captures(method)?.get(1)?.as_str().parse().ok()
}

fn siemens_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)(\d+)i(\d+)s").unwrap())
}

fn mediso_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)i(\d+)s(\d+)").unwrap())
}

fn parse_i_s(method: &str, re: &regex::Regex) -> Option<(i64, i64)> {
    let captures = re.captures(method)?;
    let iterations = captures.get(1)?.as_str().parse().ok()?;
    let subsets = captures.get(2)?.as_str().parse().ok()?;
    Some((iterations, subsets))
}

fn require(
    bag: &MetadataBag,
    tag: dicom::core::Tag,
    name: &str,
    vendor: &str,
) -> Result<(), HeaderIssue> {
    if bag.contains(tag) {
        Ok(())
    } else {
        Err(HeaderIssue(format!("{name} is missing from the {vendor} header")))
    }
}

fn require_radiopharmaceutical(bag: &MetadataBag, vendor: &str) -> Result<(), HeaderIssue> {
    bag.item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
        .and_then(|item| item.str_of(tags::RADIOPHARMACEUTICAL))
        .map(|_| ())
        .ok_or_else(|| {
            HeaderIssue(format!("Radiopharmaceutical is missing from the {vendor} header"))
        })
}

fn patch_radiopharmaceutical_from_radionuclide(
    bag: &mut MetadataBag,
    vendor: &str,
) -> Result<(), HeaderIssue> {
    let code_meaning = bag
        .item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
        .and_then(|item| item.item(tags::RADIONUCLIDE_CODE_SEQUENCE, 0))
        .and_then(|code| code.str_of(tags::CODE_MEANING))
        .map(str::to_string)
        .ok_or_else(|| {
            HeaderIssue(format!(
                "could not extract the radionuclide name from the {vendor} header"
            ))
        })?;
    bag.item_mut(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
        .expect("sequence presence was checked above")
        .set_str(tags::RADIOPHARMACEUTICAL, code_meaning);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_bag::TagValue;
    use rstest::*;

    fn bag_with_rf(manufacturer: &str) -> MetadataBag {
        let mut bag = MetadataBag::default();
        bag.set_str(tags::MANUFACTURER, manufacturer);
        bag.insert(tags::PIXEL_SPACING, TagValue::Floats(vec![3.65, 3.65]));
        bag.set_f64(tags::SLICE_THICKNESS, 3.27);
        let mut item = MetadataBag::default();
        item.set_str(tags::RADIOPHARMACEUTICAL, "Fluorodeoxyglucose");
        bag.insert(
            tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE,
            TagValue::Items(vec![item]),
        );
        bag
    }

    #[test]
    fn test_siemens_iterations_subsets() {
        // S3: "3i21s BSREM" parses to iterations=3, subsets=21
        let mut bag = bag_with_rf("SIEMENS");
        bag.set_str(tags::RECONSTRUCTION_METHOD, "3i21s BSREM");
        bag.set_str(tags::CONVOLUTION_KERNEL, "XYZ Gauss5.00");
        check_header(&mut bag).unwrap();
        assert_eq!(iterations_subsets(&bag).unwrap(), (3, 21));
    }

    #[test]
    fn test_siemens_missing_kernel_is_reported() {
        let mut bag = bag_with_rf("SIEMENS");
        bag.set_str(tags::RECONSTRUCTION_METHOD, "3i21s");
        let issue = check_header(&mut bag).unwrap_err();
        assert!(issue.0.contains("ConvolutionKernel"));
    }

    #[test]
    fn test_ge_bytes_tags() {
        let mut bag = bag_with_rf("GE MEDICAL SYSTEMS");
        bag.insert(GE_ITERATIONS, TagValue::Bytes(vec![2, 0]));
        bag.insert(GE_SUBSETS, TagValue::Bytes(vec![24, 0]));
        bag.insert(GE_IS_FILTERED, TagValue::Bytes(vec![0, 0]));
        check_header(&mut bag).unwrap();
        assert_eq!(iterations_subsets(&bag).unwrap(), (2, 24));
    }

    #[test]
    fn test_ge_filtered_requires_filter_tags() {
        let mut bag = bag_with_rf("GE MEDICAL SYSTEMS");
        bag.insert(GE_ITERATIONS, TagValue::Int(2));
        bag.insert(GE_SUBSETS, TagValue::Int(24));
        bag.insert(GE_IS_FILTERED, TagValue::Int(1));
        let issue = check_header(&mut bag).unwrap_err();
        assert!(issue.0.contains("0009,10BB"));
    }

    #[test]
    fn test_mediso_patches_kernel_and_radiopharmaceutical() {
        let mut bag = bag_with_rf("Mediso");
        bag.set_str(tags::RECONSTRUCTION_METHOD, "Tera-Tomo i4s12 @ 4.2 mm,");
        let mut code = MetadataBag::default();
        code.set_str(tags::CODE_MEANING, "^18^Fluorine");
        bag.item_mut(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
            .unwrap()
            .insert(tags::RADIONUCLIDE_CODE_SEQUENCE, TagValue::Items(vec![code]));

        let patched = check_header(&mut bag).unwrap();
        assert!(patched);
        assert_eq!(bag.f64_of(tags::CONVOLUTION_KERNEL), Some(4.2));
        assert_eq!(
            bag.item(tags::RADIOPHARMACEUTICAL_INFORMATION_SEQUENCE, 0)
                .and_then(|i| i.str_of(tags::RADIOPHARMACEUTICAL)),
            Some("^18^Fluorine")
        );
        assert_eq!(iterations_subsets(&bag).unwrap(), (4, 12));
    }

    #[rstest]
    #[case("OSEM @ 4.2 mm,", Some(4.2))]
    #[case("OSEM @4 m,", Some(4.0))]
    #[case("OSEM @ .5 mm,", Some(0.5))]
    #[case("OSEM 4.2 mm", None)]
    fn test_mediso_postfilter_regex(#[case] method: &str, #[case] expected: Option<f64>) {
        assert_eq!(mediso_postfilter_fwhm(method), expected);
    }

    #[test]
    fn test_philips_is_zero_zero() {
        let mut bag = bag_with_rf("Philips Medical Systems");
        check_header(&mut bag).unwrap();
        assert_eq!(iterations_subsets(&bag).unwrap(), (0, 0));
    }

    #[test]
    fn test_unsupported_manufacturer() {
        let mut bag = bag_with_rf("ACME");
        let issue = check_header(&mut bag).unwrap_err();
        assert!(issue.0.contains("not supported"));
    }
}
