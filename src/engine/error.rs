pub use super::{
    InvalidBusError, InvalidClipBoundsError, InvalidClipError, InvalidCursorError,
    InvalidKeyError, InvalidNoteMessageError, InvalidScaleError, KeyCollisionError,
    KeyOverflowError, LaunchClipError, PlayFromError, RegisterTargetError,
};
