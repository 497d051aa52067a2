#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Hostname doesn't identify an instance")]
    UnknownHost,
    #[error("Backend is unreachable")]
    BackendUnreachable,
    #[error("Invalid file path")]
    InvalidFilePath,
}
