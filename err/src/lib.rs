#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Device layout is not supported")]
    Device,
    #[error("Storage transfer failed")]
    Transport,
    #[error("Entry does not exist")]
    EntryMissing,
    #[error("Entry already exists")]
    EntryExists,
    #[error("Directory is not empty")]
    DirectoryNotEmpty,
    #[error("Access denied")]
    AccessDenied,
    #[error("Malformed argument")]
    BadValue,
    #[error("No free clusters left")]
    VolumeFull,
    #[error("Object pool exhausted")]
    AllocFailed,
    #[error("Operation is not applicable")]
    Invalid,
    #[error("On-disk state is inconsistent")]
    Inconsistent,
}

pub type Result<T> = core::result::Result<T, Error>;
