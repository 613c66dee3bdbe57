//! Call interception for parallelized functions.
//!
//! [`Parallelized`] wraps a plain function. Outside a capture phase it calls
//! straight through; inside one it records the call into the active
//! [`CaptureContext`](crate::capture::CaptureContext) and hands back a
//! placeholder.
//!
//! # Example
//!
//! ```
//! use std::sync::LazyLock;
//! use parallax_core::Parallelized;
//!
//! fn add_impl((a, b): (i64, i64)) -> i64 {
//!     a + b
//! }
//!
//! static ADD: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
//!     Parallelized::new("docs::add", add_impl).routing_key(|(a, _)| *a)
//! });
//!
//! // No environment is capturing, so the call runs directly.
//! assert_eq!(ADD.call((1, 2)), 3);
//! ```

use std::fmt;
use std::sync::{Arc, LazyLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::capture::{self, CaptureContext};
use crate::error::{Error, Result};
use crate::jobs::{Invocation, RoutingKey};
use crate::strategy::{BatchStrategy, Sequential};

/// A function that can be executed from a recorded invocation.
///
/// Implementors must be reachable through a `'static` reference and carry a
/// name that is stable across processes built from the same binary.
pub trait Dispatchable: Send + Sync {
    /// Stable, process-independent name.
    fn name(&self) -> &'static str;

    /// Run the function on serialized arguments, discarding its result.
    fn invoke(&self, args: &serde_json::Value) -> Result<()>;
}

type DefaultFn<A, R> = Box<dyn Fn(&A) -> R + Send + Sync>;
type KeyFn<A> = Box<dyn Fn(&A) -> std::result::Result<RoutingKey, serde_json::Error> + Send + Sync>;
type CheckFn<R> = fn(&R) -> Option<String>;

/// A function wrapped for capture and deferred execution.
///
/// `A` is the argument tuple, `R` the return type. Instances are meant to live
/// in `static`s (usually `LazyLock`), which is what the `#[parallelized]`
/// attribute generates.
pub struct Parallelized<A, R> {
    name: &'static str,
    target: fn(A) -> R,
    default_result: DefaultFn<A, R>,
    routing_key: Option<KeyFn<A>>,
    strategy: Arc<dyn BatchStrategy>,
    check: CheckFn<R>,
}

impl<A, R: Default + 'static> Parallelized<A, R> {
    /// Wrap `target`, using `R::default()` as the capture placeholder.
    pub fn new(name: &'static str, target: fn(A) -> R) -> Self {
        Self::with_default(name, target, |_| R::default())
    }
}

impl<A, R> Parallelized<A, R> {
    /// Wrap `target` with an explicit placeholder generator.
    pub fn with_default(
        name: &'static str,
        target: fn(A) -> R,
        default_result: impl Fn(&A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            target,
            default_result: Box::new(default_result),
            routing_key: None,
            strategy: Arc::new(Sequential),
            check: |_| None,
        }
    }

    /// Replace the capture placeholder generator.
    pub fn default_result(mut self, f: impl Fn(&A) -> R + Send + Sync + 'static) -> Self {
        self.default_result = Box::new(f);
        self
    }

    /// Group calls into job units by the value `f` returns.
    ///
    /// The value only needs to be serializable; it is normalized into a
    /// [`RoutingKey`] at record time.
    pub fn routing_key<K, F>(mut self, f: F) -> Self
    where
        K: Serialize,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        self.routing_key = Some(Box::new(move |args: &A| RoutingKey::normalize(&f(args))));
        self
    }

    /// Execute this function's calls with `strategy` instead of [`Sequential`].
    pub fn batch_strategy(mut self, strategy: impl BatchStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Stable name of the wrapped function.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Batch strategy used for this function's calls.
    pub fn strategy(&self) -> &Arc<dyn BatchStrategy> {
        &self.strategy
    }
}

impl<A, T, E: fmt::Display> Parallelized<A, std::result::Result<T, E>> {
    /// Treat an `Err` return as a failed call when executed on a backend.
    pub fn fail_on_err(mut self) -> Self {
        self.check = |result| result.as_ref().err().map(ToString::to_string);
        self
    }
}

impl<A, R> Parallelized<A, R>
where
    A: Serialize + DeserializeOwned + 'static,
    R: 'static,
{
    /// Call the function, or record the call if a capture is active on this
    /// thread.
    pub fn call(&'static self, args: A) -> R {
        let Some(context) = capture::active() else {
            return (self.target)(args);
        };

        self.record(&context, &args);
        (self.default_result)(&args)
    }

    fn record(&'static self, context: &CaptureContext, args: &A) {
        let key = match &self.routing_key {
            Some(key_fn) => key_fn(args),
            None => Ok(RoutingKey::unit()),
        };
        let key = match key {
            Ok(key) => key,
            Err(e) => {
                tracing::error!("Routing key for {} cannot be normalized: {}", self.name, e);
                context.poison(Error::MalformedKey {
                    function: self.name.to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };

        // Workers only see the JSON form, so it has to read back as `A`
        let invocation = Invocation::from_args(args)
            .map_err(|e| e.to_string())
            .and_then(|invocation| match A::deserialize(&invocation.args) {
                Ok(_) => Ok(invocation),
                Err(e) => Err(format!("{} does not read back: {}", invocation.args, e)),
            });
        let invocation = match invocation {
            Ok(invocation) => invocation,
            Err(message) => {
                tracing::error!("Arguments for {} cannot be recorded: {}", self.name, message);
                context.poison(Error::Serialization(format!(
                    "arguments for {}: {}",
                    self.name, message
                )));
                return;
            }
        };

        tracing::trace!("Captured call to {} under key {}", self.name, key);
        context
            .jobs()
            .record(key, self.strategy.clone(), self, invocation);
    }
}

impl<A, R> Dispatchable for Parallelized<A, R>
where
    A: Serialize + DeserializeOwned + 'static,
    R: 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn invoke(&self, args: &serde_json::Value) -> Result<()> {
        let args = A::deserialize(args)
            .map_err(|e| Error::Deserialization(format!("arguments for {}: {}", self.name, e)))?;
        let result = (self.target)(args);
        match (self.check)(&result) {
            Some(message) => Err(Error::Execution(format!("{}: {}", self.name, message))),
            None => Ok(()),
        }
    }
}

/// Lets a `LazyLock` static be registered directly.
impl<T, F> Dispatchable for LazyLock<T, F>
where
    T: Dispatchable,
    F: FnOnce() -> T + Send,
{
    fn name(&self) -> &'static str {
        LazyLock::force(self).name()
    }

    fn invoke(&self, args: &serde_json::Value) -> Result<()> {
        LazyLock::force(self).invoke(args)
    }
}

impl<A, R> fmt::Debug for Parallelized<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallelized")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .field("keyed", &self.routing_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn mul_impl((a, b): (i64, i64)) -> i64 {
        CALLS.fetch_add(1, Ordering::SeqCst);
        a * b
    }

    static MUL: LazyLock<Parallelized<(i64, i64), i64>> = LazyLock::new(|| {
        Parallelized::with_default("intercept::mul", mul_impl, |_| -1).routing_key(|(a, _)| *a)
    });

    fn bad_key_impl(x: (i64,)) -> i64 {
        x.0
    }

    static BAD_KEY: LazyLock<Parallelized<(i64,), i64>> = LazyLock::new(|| {
        Parallelized::new("intercept::bad_key", bad_key_impl).routing_key(|(x,)| {
            let map: HashMap<(i64, i64), i64> = [((*x, *x), 1)].into_iter().collect();
            map
        })
    });

    fn parse_impl((s,): (String,)) -> std::result::Result<i64, String> {
        s.parse::<i64>().map_err(|e| e.to_string())
    }

    static PARSE: LazyLock<Parallelized<(String,), std::result::Result<i64, String>>> =
        LazyLock::new(|| {
            Parallelized::with_default("intercept::parse", parse_impl, |_| Ok(0)).fail_on_err()
        });

    fn half_impl((x,): (f64,)) -> f64 {
        x / 2.0
    }

    static HALF: LazyLock<Parallelized<(f64,), f64>> =
        LazyLock::new(|| Parallelized::new("intercept::half", half_impl));

    #[test]
    fn test_non_finite_arguments_poison_at_record_time() {
        assert_eq!(HALF.call((f64::INFINITY,)), f64::INFINITY);

        let ctx = Arc::new(CaptureContext::new());
        capture::install(ctx.clone()).unwrap();

        assert_eq!(HALF.call((3.0,)), 0.0);
        assert_eq!(HALF.call((f64::NAN,)), 0.0);

        capture::clear(&ctx);
        assert_eq!(ctx.jobs().len(), 1);
        match ctx.take_poison() {
            Some(Error::Serialization(message)) => {
                assert!(message.contains("intercept::half"), "{}", message);
            }
            other => panic!("unexpected poison: {:?}", other),
        }
    }

    #[test]
    fn test_transparent_without_capture() {
        let before = CALLS.load(Ordering::SeqCst);
        assert_eq!(MUL.call((6, 7)), 42);
        assert!(CALLS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_capture_records_and_returns_placeholder() {
        let ctx = Arc::new(CaptureContext::new());
        capture::install(ctx.clone()).unwrap();

        assert_eq!(MUL.call((2, 3)), -1);
        assert_eq!(MUL.call((2, 5)), -1);
        assert_eq!(MUL.call((4, 5)), -1);

        capture::clear(&ctx);

        let spec = ctx.jobs().snapshot();
        assert_eq!(spec.len(), 2);
        assert_eq!(spec.call_count(), 3);
        let two = RoutingKey::normalize(&2).unwrap();
        let calls = &spec.unit(&two).unwrap().strategies["sequential"].functions["intercept::mul"].calls;
        assert_eq!(calls[0].args, serde_json::json!([2, 3]));
    }

    #[test]
    fn test_malformed_key_poisons_context() {
        let ctx = Arc::new(CaptureContext::new());
        capture::install(ctx.clone()).unwrap();

        assert_eq!(BAD_KEY.call((3,)), 0);

        capture::clear(&ctx);
        assert!(ctx.jobs().is_empty());
        assert!(matches!(ctx.take_poison(), Some(Error::MalformedKey { .. })));
    }

    #[test]
    fn test_invoke_deserializes_arguments() {
        MUL.invoke(&serde_json::json!([3, 4])).unwrap();

        let err = MUL.invoke(&serde_json::json!(["x"])).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[test]
    fn test_lazy_static_is_dispatchable() {
        let function: &'static dyn Dispatchable = &MUL;
        assert_eq!(function.name(), "intercept::mul");
        function.invoke(&serde_json::json!([1, 1])).unwrap();
    }

    #[test]
    fn test_fail_on_err_reports_failures() {
        PARSE.invoke(&serde_json::json!(["12"])).unwrap();
        let err = PARSE.invoke(&serde_json::json!(["twelve"])).unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
    }
}
