pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("remote backup is not configured")]
    NotConfigured,

    #[error("no backup category selected")]
    NoCategorySelected,

    #[error("connectivity failure: {message}")]
    Connectivity { message: String },

    #[error("permission failure: {message}")]
    Permission { message: String },

    #[error("transfer failure: {message}")]
    Transfer { message: String },

    #[error("archive corrupt: {message}")]
    ArchiveCorrupt { message: String },

    #[error("config migration failed: {message}")]
    Migration { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("secrets store error: {message}")]
    Secrets { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfiguration,
    NotConfigured,
    NoCategorySelected,
    Connectivity,
    Permission,
    Transfer,
    ArchiveCorrupt,
    Migration,
    LocalStorage,
}

impl ErrorKind {
    /// Connectivity and transfer failures leave no partial remote state behind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Connectivity | Self::Transfer)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            Self::NotConfigured => ErrorKind::NotConfigured,
            Self::NoCategorySelected => ErrorKind::NoCategorySelected,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::ArchiveCorrupt { .. } => ErrorKind::ArchiveCorrupt,
            Self::Migration { .. } => ErrorKind::Migration,
            Self::Io(_) | Self::Sqlite(_) | Self::Secrets { .. } => ErrorKind::LocalStorage,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub(crate) fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::ArchiveCorrupt {
            message: message.into(),
        }
    }
}
