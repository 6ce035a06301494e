use core::fmt;

/// The error type for segment and option decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// Incoming bytes could not be parsed because they were shorter than assumed.
    ///
    /// Either shorter than the fixed header, or a variable length field (the data offset, an
    /// option length) pointing beyond the received data.
    Truncated,

    /// An incoming segment had an incorrect checksum.
    ///
    /// Segment decoding itself does not fail with this error. The result carries a flag instead,
    /// so that the receiving endpoint can report a distinct receive status.
    WrongChecksum,

    /// An incoming value could not be recognized.
    Unrecognized,

    /// Incoming bytes were recognized but were self-contradictory.
    ///
    /// Examples: an option with a length below two, a timestamp option of length eight, a data
    /// offset below the minimum header length.
    Malformed,

    /// The value can not be represented in this implementation.
    ///
    /// For example an option list that would exceed the forty bytes of option space.
    Unsupported,
}

/// The result type for the wire codecs.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated     => write!(f, "truncated segment"),
            Error::WrongChecksum => write!(f, "checksum error"),
            Error::Unrecognized  => write!(f, "unrecognized value"),
            Error::Unsupported   => write!(f, "unsupported value"),
            Error::Malformed     => write!(f, "malformed segment"),
        }
    }
}

impl std::error::Error for Error {}
