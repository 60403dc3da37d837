mod decode;
mod frames;
mod session;

pub use decode::{CodeDecoder, DecodedCode, Region, RqrrDecoder};
pub use frames::{DirFrameSource, FrameSource};
pub use session::{
    AbortReason, AttendanceLedger, IdentityLookup, InsertOutcome, ScanError, ScanSession,
    SessionController, SessionOptions, SessionOutcome, SessionState, SessionSummary,
};
