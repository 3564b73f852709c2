//! Minting of DICOM UIDs for rebuilt instances and series.

/// A new unique UID in the UUID-derived `2.25.<decimal>` form.
pub(crate) fn new_uid() -> String {
    let uuid = uuid::Uuid::new_v4();
    format!("2.25.{}", u128::from_be_bytes(*uuid.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_shape() {
        let uid = new_uid();
        assert!(uid.starts_with("2.25."));
        assert!(uid.len() <= 64, "DICOM UIDs are capped at 64 chars");
        assert!(uid[5..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_uids_are_unique() {
        assert_ne!(new_uid(), new_uid());
    }
}
