use thiserror::Error;

/// Error codes returned by every fallible operation.
///
/// Each variant carries a stable numeric code so that the ACK round of a
/// collective can ship the first failure to every rank and have all of them
/// return the same error from the same call site. Context strings do not
/// survive the wire; the code does.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("null or unset variable: {0}")]
    NullVariable(String),
    #[error("cannot open file: {0}")]
    FileOpen(String),
    #[error("invalid base node: {0}")]
    InvalidBase(String),
    #[error("invalid zone node: {0}")]
    InvalidZone(String),
    #[error("invalid grid coordinates: {0}")]
    InvalidGridCoordinates(String),
    #[error("invalid elements section: {0}")]
    InvalidElements(String),
    #[error("invalid flow solution: {0}")]
    InvalidFlowSolution(String),
    #[error("invalid iterative data: {0}")]
    InvalidIterativeData(String),
    #[error("invalid user defined data: {0}")]
    InvalidUserData(String),
    #[error("invalid mpi state: {0}")]
    InvalidMpi(String),
    #[error("ack codes disagree across ranks: {0}")]
    AckMismatch(String),
    #[error("serialize failure: {0}")]
    Serialize(String),
    #[error("deserialize failure: {0}")]
    Deserialize(String),
    #[error("solution field not found: {0}")]
    NotFoundSolution(String),
    #[error("invalid element type: {0}")]
    InvalidElementType(String),
    #[error("unsupported element type: {0}")]
    NotSupportedElementType(String),
}

impl Error {
    /// Stable wire code, nonzero. `0` is reserved for "no error" in ACK
    /// exchanges.
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidParameter(_) => 101,
            Error::NullVariable(_) => 102,
            Error::FileOpen(_) => 103,
            Error::InvalidBase(_) => 110,
            Error::InvalidZone(_) => 111,
            Error::InvalidGridCoordinates(_) => 112,
            Error::InvalidElements(_) => 113,
            Error::InvalidFlowSolution(_) => 114,
            Error::InvalidIterativeData(_) => 115,
            Error::InvalidUserData(_) => 116,
            Error::InvalidMpi(_) => 120,
            Error::AckMismatch(_) => 121,
            Error::Serialize(_) => 130,
            Error::Deserialize(_) => 131,
            Error::NotFoundSolution(_) => 140,
            Error::InvalidElementType(_) => 141,
            Error::NotSupportedElementType(_) => 142,
        }
    }

    /// Rebuild an error from a wire code received in an ACK round. The
    /// context string is lost in transit; the peer rank keeps its own.
    pub fn from_code(code: u32) -> Error {
        let ctx = || format!("received from peer rank (code {code})");
        match code {
            101 => Error::InvalidParameter(ctx()),
            102 => Error::NullVariable(ctx()),
            103 => Error::FileOpen(ctx()),
            110 => Error::InvalidBase(ctx()),
            111 => Error::InvalidZone(ctx()),
            112 => Error::InvalidGridCoordinates(ctx()),
            113 => Error::InvalidElements(ctx()),
            114 => Error::InvalidFlowSolution(ctx()),
            115 => Error::InvalidIterativeData(ctx()),
            116 => Error::InvalidUserData(ctx()),
            120 => Error::InvalidMpi(ctx()),
            130 => Error::Serialize(ctx()),
            131 => Error::Deserialize(ctx()),
            140 => Error::NotFoundSolution(ctx()),
            141 => Error::InvalidElementType(ctx()),
            142 => Error::NotSupportedElementType(ctx()),
            _ => Error::AckMismatch(format!("unknown wire code {code}")),
        }
    }
}

/// Non-fatal conditions. Reported alongside a successful result and logged,
/// never propagated with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    MissingIterativeData,
    SimulationTypeUnknown,
    NoChangePartition,
    EmptyCell,
}

impl Warning {
    pub fn code(&self) -> u32 {
        match self {
            Warning::MissingIterativeData => 201,
            Warning::SimulationTypeUnknown => 202,
            Warning::NoChangePartition => 203,
            Warning::EmptyCell => 204,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        let errors = [
            Error::InvalidParameter("x".into()),
            Error::FileOpen("y".into()),
            Error::Serialize("z".into()),
            Error::NotFoundSolution("p".into()),
            Error::NotSupportedElementType("q".into()),
        ];
        for e in errors {
            let back = Error::from_code(e.code());
            assert_eq!(back.code(), e.code());
        }
    }

    #[test]
    fn test_warning_codes_are_disjoint_from_errors() {
        let warnings = [
            Warning::MissingIterativeData,
            Warning::SimulationTypeUnknown,
            Warning::NoChangePartition,
            Warning::EmptyCell,
        ];
        for w in warnings {
            assert!(w.code() >= 200);
        }
    }
}
