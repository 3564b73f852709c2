//! Zip packing/unpacking of the shared-drive interchange archives.
use camino::Utf8Path;
use sha2::{Digest, Sha256};
use std::io::Read;
use zip::write::FileOptions;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ArchiveError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error("archive entry has an unusable name")]
    BadEntryName,
}

/// Zip the files directly inside `src` (the interchange archives are flat)
/// into a deflate-compressed archive at `dest`.
pub(crate) fn zip_directory(src: &Utf8Path, dest: &Utf8Path) -> Result<(), ArchiveError> {
    let file = fs_err::File::create(dest.as_std_path())?;
    let mut writer = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in fs_err::read_dir(src.as_std_path())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| ArchiveError::BadEntryName)?;
        writer.start_file(&name, options)?;
        let mut reader = fs_err::File::open(entry.path())?;
        std::io::copy(&mut reader, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

/// Extract an archive into `dest`, creating directories as needed.
pub(crate) fn extract_zip(src: &Utf8Path, dest: &Utf8Path) -> Result<(), ArchiveError> {
    let file = fs_err::File::open(src.as_std_path())?;
    let mut archive = zip::ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let outpath = dest.as_std_path().join(entry.mangled_name());
        if entry.name().ends_with('/') {
            fs_err::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let mut outfile = fs_err::File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

/// Hex SHA-256 of a file's bytes.
pub(crate) fn sha256_file(path: &Utf8Path) -> Result<String, std::io::Error> {
    let mut file = fs_err::File::open(path.as_std_path())?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn test_zip_round_trip_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let staging = root.join("staging");
        fs_err::create_dir_all(staging.as_std_path()).unwrap();
        fs_err::write(staging.join("voxels.npy").as_std_path(), b"not really npy").unwrap();
        fs_err::write(staging.join("metadata.json").as_std_path(), b"{}").unwrap();

        let before = sha256_file(&staging.join("voxels.npy")).unwrap();
        assert_eq!(before.len(), 64);

        let archive = root.join("bundle.zip");
        zip_directory(&staging, &archive).unwrap();
        let out = root.join("out");
        extract_zip(&archive, &out).unwrap();

        let after = sha256_file(&out.join("voxels.npy")).unwrap();
        assert_eq!(before, after);
        assert!(out.join("metadata.json").as_std_path().exists());
    }
}
