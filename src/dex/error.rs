use std::fmt;

/// Return early with a [`DexError`] built from a literal or a format string.
#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::dex::error::DexError::new($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::dex::error::DexError::new(&format!($fmtstr, $($args)*)))
    };
}

/// Build a [`DexError`] without returning, for use in `ok_or_else` and friends.
#[macro_export]
macro_rules! err {
    ($msg:literal) => {
        $crate::dex::error::DexError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::dex::error::DexError::new(&format!($fmtstr, $($args)*))
    };
}

/// Error raised while decoding, rewriting or encoding a dex unit.
///
/// The message describes the innermost failure; each context added on the way
/// out names the enclosing structure, so a rendered error reads like
/// `index out of range for code item of Lcom/app/Foo;->bar()V`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexError
{
    msg: String,
    contexts: Vec<String>,
}

impl DexError
{
    pub fn new(msg: &str) -> Self
    {
        DexError {
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub fn with_context(base: DexError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        DexError { msg: base.msg, contexts }
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

/// Attach a context string to the error side of a result.
pub(crate) trait ResultExt<T>
{
    fn context<F: FnOnce() -> String>(self, f: F) -> Result<T, DexError>;
}

impl<T> ResultExt<T> for Result<T, DexError>
{
    fn context<F: FnOnce() -> String>(self, f: F) -> Result<T, DexError>
    {
        self.map_err(|e| DexError::with_context(e, f()))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn nested() -> Result<(), DexError>
    {
        fail!("index {} out of range", 7);
    }

    #[test]
    fn renders_context_chain()
    {
        let e = nested()
            .context(|| "code item".to_string())
            .context(|| "Lcom/app/Foo;->bar()V".to_string())
            .unwrap_err();
        assert_eq!(e.to_string(), "index 7 out of range for code item of Lcom/app/Foo;->bar()V");
        assert_eq!(e.message(), "index 7 out of range");
    }
}
