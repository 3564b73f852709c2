use petrelay::InstanceRecord;

/// Row metadata of a synthetic PET instance, laid out the way the receive
/// path stores files.
pub fn pet_instance_record(sop: &str, series: &str, study: &str) -> InstanceRecord {
    InstanceRecord {
        sop_uid: sop.to_string(),
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.128".to_string(),
        filename: format!("incoming/{study}/{series}/{sop}").into(),
        patient_id: "PAT-1".to_string(),
        patient_name: Some("DOE^JANE".to_string()),
        study_uid: study.to_string(),
        study_date: None,
        study_description: Some("PET WB FDG".to_string()),
        patient_weight: Some(81.4),
        patient_size: Some(1.76),
        patient_age: Some("065Y".to_string()),
        series_uid: series.to_string(),
        series_date: None,
        series_description: Some("AC PET".to_string()),
        modality: Some("PT".to_string()),
        series_number: Some(3),
        study_dir: format!("incoming/{study}").into(),
        series_dir: format!("incoming/{study}/{series}").into(),
    }
}
