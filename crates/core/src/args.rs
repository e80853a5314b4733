//! Values derived from job arguments.
//!
//! Limits, periods and key suffixes are either fixed at registration time or
//! computed from the job's arguments on every evaluation. Functions return
//! `anyhow::Result` so user code can fail with any error type; the strategy
//! layer converts failures into `ThrottleError::KeyFunction`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Arguments of a job as found in its payload.
pub type JobArgs = [Value];

type ArgsFn<T> = Arc<dyn Fn(&JobArgs) -> anyhow::Result<T> + Send + Sync>;

/// A static value or a function of job arguments.
///
/// A dynamic value resolving to `None` disables the check for that job.
#[derive(Clone)]
pub enum ArgsValue<T> {
    Static(T),
    Dynamic(ArgsFn<Option<T>>),
}

/// Maximum number of jobs (in flight or started per period).
pub type Limit = ArgsValue<u64>;

/// Rolling window length of a threshold check.
pub type Period = ArgsValue<Duration>;

impl<T: Clone> ArgsValue<T> {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&JobArgs) -> anyhow::Result<Option<T>> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, args: &JobArgs) -> anyhow::Result<Option<T>> {
        match self {
            Self::Static(value) => Ok(Some(value.clone())),
            Self::Dynamic(f) => f(args),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    /// The value when it does not depend on arguments.
    pub fn as_static(&self) -> Option<&T> {
        match self {
            Self::Static(value) => Some(value),
            Self::Dynamic(_) => None,
        }
    }
}

impl<T> From<T> for ArgsValue<T> {
    fn from(value: T) -> Self {
        Self::Static(value)
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for ArgsValue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Derives a fingerprint suffix from job arguments.
///
/// Must be a pure function: equal arguments must produce equal suffixes or
/// jobs that should share a bucket will be spread across several.
#[derive(Clone)]
pub struct KeySuffix(ArgsFn<String>);

impl KeySuffix {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&JobArgs) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Suffix built from the argument at `index`, rendered without JSON quotes
    /// for strings.
    pub fn arg(index: usize) -> Self {
        Self::new(move |args| {
            let value = args
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("job has no argument at index {index}"))?;
            Ok(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }

    pub fn suffix(&self, args: &JobArgs) -> anyhow::Result<String> {
        (self.0)(args)
    }
}

impl core::fmt::Debug for KeySuffix {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("KeySuffix(<fn>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_values_ignore_arguments() {
        let limit: Limit = 5.into();
        assert_eq!(limit.resolve(&[json!(1)]).unwrap(), Some(5));
        assert!(!limit.is_dynamic());
    }

    #[test]
    fn dynamic_values_see_arguments() {
        let limit = Limit::dynamic(|args| Ok(args.first().and_then(Value::as_u64)));

        assert_eq!(limit.resolve(&[json!(3)]).unwrap(), Some(3));
        assert_eq!(limit.resolve(&[json!("x")]).unwrap(), None);
        assert!(limit.as_static().is_none());
    }

    #[test]
    fn arg_suffix_renders_strings_bare() {
        let suffix = KeySuffix::arg(1);

        assert_eq!(suffix.suffix(&[json!(1), json!("acme")]).unwrap(), "acme");
        assert_eq!(suffix.suffix(&[json!(1), json!(42)]).unwrap(), "42");
        assert!(suffix.suffix(&[json!(1)]).is_err());
    }
}
