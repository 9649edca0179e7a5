use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};

use op_state_store::RecordMutation;

/// Error details captured from work that did not complete normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFailure {
    pub message: String,
    pub stack: String,
}

impl WorkFailure {
    /// Capture an error returned by the work.
    ///
    /// The stack is the error's debug rendering, which for `anyhow` includes
    /// the cause chain and a backtrace when one was captured.
    pub fn from_error(err: &anyhow::Error, max_stack_len: usize) -> Self {
        let message = err.to_string();
        let stack = format!("{:?}", err);
        Self {
            message,
            stack: truncate_on_char_boundary(stack, max_stack_len),
        }
    }

    /// Capture a panic payload from `catch_unwind`
    pub fn from_panic(payload: &(dyn Any + Send), max_stack_len: usize) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        let message = format!("work panicked: {}", detail);

        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => format!("{}\n\n{}", message, backtrace),
            _ => message.clone(),
        };

        Self {
            message,
            stack: truncate_on_char_boundary(stack, max_stack_len),
        }
    }

    /// Mutation that writes these details onto the record
    pub fn into_mutation(self) -> RecordMutation {
        Box::new(move |record| {
            record.error_message = Some(self.message);
            record.error_stack = Some(self.stack);
        })
    }
}

/// Cut `s` to at most `max_len` bytes without splitting a character
pub(crate) fn truncate_on_char_boundary(mut s: String, max_len: usize) -> String {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
