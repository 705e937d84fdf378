use core::fmt;

pub mod server;

/// Errors of the socket-facing layer: either transport failures or frames we
/// could not make sense of.
#[derive(Debug)]
pub enum Error<E> {
    Io(E),
    Format(crate::Error),
}

impl<E> From<crate::Error> for Error<E> {
    fn from(value: crate::Error) -> Self {
        Self::Format(value)
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::Format(err) => write!(f, "Format error: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug + fmt::Display> std::error::Error for Error<E> {}
