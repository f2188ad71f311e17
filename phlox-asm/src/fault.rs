use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
/// Recoverable fault reasons reported by the interpreter.
///
/// A fault never aborts the VM by itself: the dispatcher emits a diagnostic
/// at the fault's [`Severity`] and continues with a substitute value (null,
/// zero, or false). User code may convert any fault site into a catchable
/// control transfer by throwing a Throwable instance instead.
pub enum Fault {
    /// The byte can't be mapped to any known `Fault`.
    UnknownFault = 0x00,
    /// Division with a zero divisor; the result is substituted with zero.
    DivisionByZero = 0x01,
    /// Modulo with a zero divisor; the result is substituted with zero.
    ModuloByZero = 0x02,
    /// An argument value violated a formal argument's type constraint.
    TypeConstraint = 0x03,
    /// A class constant was accessed as if it were a variable.
    ConstantAsVariable = 0x04,
    /// The user-call depth ceiling was exceeded; the call returns null.
    RecursionLimit = 0x05,
    /// The callee is neither a function name, a callable array, nor an
    /// invokable object.
    NotCallable = 0x06,
    /// `new` on an abstract class.
    AbstractInstantiation = 0x07,
    /// `new` on an interface.
    InterfaceInstantiation = 0x08,
    /// The thrown value's class does not carry the Throwable marker.
    ThrowNotThrowable = 0x09,
    /// `clone` on a non-object.
    CloneNonObject = 0x0a,
    /// Index read with a key the subject does not contain.
    MissingIndex = 0x0b,
    /// Operand types outside the coercion rules of the operation.
    InvalidOperands = 0x0c,
    /// Call to a function name with no user, foreign, or generated binding.
    UnknownFunction = 0x0d,
    /// Reference to an unregistered class name.
    UnknownClass = 0x0e,
    /// Method lookup failed on the class and all of its ancestors.
    UnknownMethod = 0x0f,
    /// Attribute lookup failed on the class and all of its ancestors.
    UnknownAttribute = 0x10,
    /// Member access rejected by the visibility rules.
    Visibility = 0x11,
    /// Member access on a value that is not an object.
    NotAnObject = 0x12,
    /// Index write on a value that supports no element storage.
    NotAnArray = 0x13,
    /// Read of a variable with no binding, created on demand.
    UndefinedVariable = 0x14,
    /// An element or attribute was created implicitly by a write through a
    /// missing path.
    AutoVivification = 0x15,
    /// A null argument was substituted with the formal's default value.
    NullArgumentDefault = 0x16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Diagnostic severity of a [`Fault`].
pub enum Severity {
    /// Surprising but well-defined behavior.
    Notice,
    /// An operation that could not do what was asked.
    Warning,
    /// A recoverable error; execution continues with a substitute value.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notice => write!(f, "Notice"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl Fault {
    /// The severity this fault is diagnosed at.
    pub const fn severity(&self) -> Severity {
        use Fault::*;
        match self {
            DivisionByZero | ModuloByZero | TypeConstraint | ConstantAsVariable
            | RecursionLimit | NotCallable | AbstractInstantiation | InterfaceInstantiation
            | ThrowNotThrowable | CloneNonObject => Severity::Error,
            MissingIndex | InvalidOperands | UnknownFunction | UnknownClass | UnknownMethod
            | UnknownAttribute | Visibility | NotAnObject | NotAnArray | UnknownFault => {
                Severity::Warning
            }
            UndefinedVariable | AutoVivification | NullArgumentDefault => Severity::Notice,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<u8> for Fault {
    /// Converts the `u8` into a `Fault`.
    fn from(b: u8) -> Self {
        use Fault::*;
        match b {
            0x01 => DivisionByZero,
            0x02 => ModuloByZero,
            0x03 => TypeConstraint,
            0x04 => ConstantAsVariable,
            0x05 => RecursionLimit,
            0x06 => NotCallable,
            0x07 => AbstractInstantiation,
            0x08 => InterfaceInstantiation,
            0x09 => ThrowNotThrowable,
            0x0a => CloneNonObject,
            0x0b => MissingIndex,
            0x0c => InvalidOperands,
            0x0d => UnknownFunction,
            0x0e => UnknownClass,
            0x0f => UnknownMethod,
            0x10 => UnknownAttribute,
            0x11 => Visibility,
            0x12 => NotAnObject,
            0x13 => NotAnArray,
            0x14 => UndefinedVariable,
            0x15 => AutoVivification,
            0x16 => NullArgumentDefault,
            _ => UnknownFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn fault_u8_round_trip() {
        let last_known: u8 = Fault::iter().last().unwrap() as u8 + 1;
        assert_eq!(Fault::from(0), Fault::UnknownFault);

        for i in 1..last_known {
            let fault = Fault::from(i);
            assert_eq!(i, fault as u8);
        }
        for i in last_known..=255 {
            assert_eq!(Fault::from(i), Fault::UnknownFault);
        }
    }
}
