#[derive(thiserror::Error, Debug)]
pub enum TaskStoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("task {0} does not exist")]
    TaskNotFound(String),

    #[error("app config row is missing")]
    MissingAppConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum DicomStorageError {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Write(#[from] dicom::object::WriteError),

    #[error(transparent)]
    MissingTag(#[from] MissingRequiredTag),

    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

#[derive(thiserror::Error, Debug)]
#[error("DICOM file does not have the required tag: \"{0}\"")]
pub struct MissingRequiredTag(pub &'static str);

/// Error from one of the pipeline loops. The message names which loop died;
/// details were already logged by the loop itself.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct HandleLoopError(pub &'static str);
