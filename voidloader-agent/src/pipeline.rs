//! Transformation pipeline
//!
//! Runs the rules of every enabled extension, in registry order, against the
//! current class buffer. A failing rule leaves the buffer as it was and the
//! pass continues with the next extension. The final bytes are always copied
//! into a fresh host allocation, even when nothing changed.

use crate::buffer::{AllocError, HostAllocator, HostBuffer};
use crate::registry::{ExtensionRecord, ExtensionRegistry};
use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use voidloader_api::TransformError;

/// Errors that abort a whole pipeline pass
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Class buffer is empty")]
    EmptyInput,

    #[error("Failed to allocate the result buffer: {0}")]
    Allocation(#[from] AllocError),
}

/// One extension's rule that failed during a pass
#[derive(Debug)]
pub struct RuleFailure {
    /// Identity name of the extension
    pub extension: String,
    /// What went wrong
    pub error: TransformError,
}

/// Result of one pipeline pass
#[derive(Debug)]
pub struct TransformOutcome<'a> {
    /// Final class bytes in host memory, never the input allocation
    pub buffer: HostBuffer<'a>,
    /// Extensions whose rule succeeded, in application order
    pub applied: Vec<String>,
    /// Extensions whose rule failed and was skipped
    pub failures: Vec<RuleFailure>,
}

impl TransformOutcome<'_> {
    /// True when no rule contributed to the buffer
    pub fn is_pass_through(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Applies extension rules to target classes
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    registry: Arc<ExtensionRegistry>,
}

impl TransformPipeline {
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Run one pass for `class_name`
    ///
    /// The caller has already classified `class_name` as a target. Each rule
    /// is invoked at most once.
    pub fn transform<'a>(
        &self,
        class_name: &str,
        initial: &[u8],
        allocator: &'a dyn HostAllocator,
    ) -> Result<TransformOutcome<'a>, PipelineError> {
        if initial.is_empty() {
            return Err(PipelineError::EmptyInput);
        }

        let mut current: Cow<'_, [u8]> = Cow::Borrowed(initial);
        let mut applied = Vec::new();
        let mut failures = Vec::new();

        for record in self.registry.enabled() {
            let result = match apply_rule(record, class_name, &current) {
                Some(result) => result,
                None => continue,
            };

            match result {
                Ok(next) => {
                    tracing::debug!(
                        class = %class_name,
                        extension = %record.name(),
                        before = current.len(),
                        after = next.len(),
                        "Rule applied"
                    );
                    applied.push(record.name().to_string());
                    current = Cow::Owned(next);
                }
                Err(error) => {
                    tracing::warn!(
                        class = %class_name,
                        extension = %record.name(),
                        error = %error,
                        "Rule failed, keeping previous buffer"
                    );
                    failures.push(RuleFailure {
                        extension: record.name().to_string(),
                        error,
                    });
                }
            }
        }

        if applied.is_empty() {
            tracing::debug!(class = %class_name, len = initial.len(), "No rule applied, passing through");
        }

        let buffer = HostBuffer::copy_from(allocator, &current)?;
        Ok(TransformOutcome {
            buffer,
            applied,
            failures,
        })
    }
}

/// Ask `record` for a rule and run it; `None` when it declares none
fn apply_rule(
    record: &ExtensionRecord,
    class_name: &str,
    input: &[u8],
) -> Option<Result<Vec<u8>, TransformError>> {
    let step = panic::catch_unwind(AssertUnwindSafe(|| {
        record
            .rule_for(class_name)
            .map(|rule| rule.transform(class_name, input))
    }));

    match step {
        Ok(None) => None,
        Ok(Some(result)) => Some(result.and_then(check_output)),
        Err(payload) => Some(Err(TransformError::Panicked(panic_message(payload.as_ref())))),
    }
}

fn check_output(output: Vec<u8>) -> Result<Vec<u8>, TransformError> {
    if output.is_empty() {
        return Err(TransformError::EmptyOutput);
    }
    if output.len() > i32::MAX as usize {
        return Err(TransformError::Oversized(output.len()));
    }
    Ok(output)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapAllocator;
    use crate::registry::ExtensionKind;
    use std::ptr::NonNull;
    use voidloader_api::ClassTransformer;

    const CLASS: &str = "net/minecraft/client/Minecraft";

    struct Append(u8);

    impl ClassTransformer for Append {
        fn applies_to(&self, class_name: &str) -> bool {
            class_name == CLASS
        }

        fn transform(&self, _: &str, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
            let mut out = bytes.to_vec();
            out.push(self.0);
            Ok(out)
        }
    }

    struct Fails;

    impl ClassTransformer for Fails {
        fn applies_to(&self, _: &str) -> bool {
            true
        }

        fn transform(&self, class_name: &str, _: &[u8]) -> Result<Vec<u8>, TransformError> {
            Err(TransformError::rejected(class_name, "unsupported layout"))
        }
    }

    struct Panics;

    impl ClassTransformer for Panics {
        fn applies_to(&self, _: &str) -> bool {
            true
        }

        fn transform(&self, _: &str, _: &[u8]) -> Result<Vec<u8>, TransformError> {
            panic!("rule blew up")
        }
    }

    struct Empties;

    impl ClassTransformer for Empties {
        fn applies_to(&self, _: &str) -> bool {
            true
        }

        fn transform(&self, _: &str, _: &[u8]) -> Result<Vec<u8>, TransformError> {
            Ok(Vec::new())
        }
    }

    struct NoMemory;

    unsafe impl HostAllocator for NoMemory {
        fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
            Err(AllocError::Refused { len, code: 110 })
        }

        unsafe fn release(&self, _: NonNull<u8>, _: usize) {}
    }

    fn record(name: &str, rule: Arc<dyn ClassTransformer>) -> ExtensionRecord {
        ExtensionRecord::new(name, ExtensionKind::Managed, format!("{name}.jar"))
            .unwrap()
            .with_rule(rule)
    }

    fn pipeline(records: Vec<ExtensionRecord>) -> TransformPipeline {
        let mut registry = ExtensionRegistry::new();
        for record in records {
            registry.admit(record).unwrap();
        }
        TransformPipeline::new(Arc::new(registry))
    }

    #[test]
    fn test_empty_registry_passes_through_fresh_copy() {
        let input = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00];
        let outcome = pipeline(vec![])
            .transform(CLASS, &input, &HeapAllocator)
            .unwrap();

        assert!(outcome.is_pass_through());
        assert_eq!(outcome.buffer.as_slice(), input.as_slice());
        assert_ne!(outcome.buffer.as_ptr(), input.as_ptr());
    }

    #[test]
    fn test_rules_apply_in_registry_order() {
        let outcome = pipeline(vec![
            record("first", Arc::new(Append(1))),
            record("second", Arc::new(Append(2))),
            record("third", Arc::new(Append(3))),
        ])
        .transform(CLASS, &[0xCA], &HeapAllocator)
        .unwrap();

        assert_eq!(outcome.buffer.as_slice(), &[0xCA, 1, 2, 3]);
        assert_eq!(outcome.applied, vec!["first", "second", "third"]);
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_failed_rule_is_isolated() {
        let outcome = pipeline(vec![
            record("first", Arc::new(Append(1))),
            record("broken", Arc::new(Fails)),
            record("third", Arc::new(Append(3))),
        ])
        .transform(CLASS, &[0xCA], &HeapAllocator)
        .unwrap();

        assert_eq!(outcome.buffer.as_slice(), &[0xCA, 1, 3]);
        assert_eq!(outcome.applied, vec!["first", "third"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].extension, "broken");
        assert!(matches!(
            outcome.failures[0].error,
            TransformError::Rejected { .. }
        ));
    }

    #[test]
    fn test_panicking_rule_is_caught() {
        let outcome = pipeline(vec![
            record("panics", Arc::new(Panics)),
            record("after", Arc::new(Append(9))),
        ])
        .transform(CLASS, &[0xCA], &HeapAllocator)
        .unwrap();

        assert_eq!(outcome.buffer.as_slice(), &[0xCA, 9]);
        match &outcome.failures[0].error {
            TransformError::Panicked(message) => assert!(message.contains("rule blew up")),
            other => panic!("Expected panic failure, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_rule_output_is_a_failure() {
        let outcome = pipeline(vec![record("empties", Arc::new(Empties))])
            .transform(CLASS, &[0xCA, 0xFE], &HeapAllocator)
            .unwrap();

        assert_eq!(outcome.buffer.as_slice(), &[0xCA, 0xFE]);
        assert!(matches!(
            outcome.failures[0].error,
            TransformError::EmptyOutput
        ));
    }

    #[test]
    fn test_disabled_and_unrelated_extensions_are_skipped() {
        let p = pipeline(vec![
            record("off", Arc::new(Append(1))).disabled(),
            record("on", Arc::new(Append(2))),
            ExtensionRecord::new("plain", ExtensionKind::Native, "plain.so").unwrap(),
        ]);

        let outcome = p.transform(CLASS, &[0], &HeapAllocator).unwrap();
        assert_eq!(outcome.buffer.as_slice(), &[0, 2]);

        let outcome = p
            .transform("net/minecraft/server/MinecraftServer", &[0], &HeapAllocator)
            .unwrap();
        assert!(outcome.is_pass_through());
        assert_eq!(outcome.buffer.as_slice(), &[0]);
    }

    #[test]
    fn test_rejects_empty_input() {
        let err = pipeline(vec![])
            .transform(CLASS, &[], &HeapAllocator)
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyInput));
    }

    #[test]
    fn test_allocation_failure_aborts_pass() {
        let err = pipeline(vec![record("first", Arc::new(Append(1)))])
            .transform(CLASS, &[0xCA], &NoMemory)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Allocation(AllocError::Refused { code: 110, .. })
        ));
    }
}
