//! Small helpers shared by the fatal-assertion and exception paths.

use tracing::error;

/// Renders the current backtrace with a bounded frame count.
///
/// `skip` drops the innermost frames (this helper and its caller),
/// `prefix` is prepended to every emitted line. Used only on exception
/// and fatal paths, never during a context switch.
pub fn backtrace_to_string(max_frames: usize, skip: usize, prefix: &str) -> String {
    let captured = std::backtrace::Backtrace::force_capture().to_string();
    let mut out = String::new();
    for line in captured.lines().skip(skip).take(max_frames) {
        out.push_str(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Logs a fatal condition with a backtrace and aborts the process.
///
/// Used for precondition violations and unrecoverable runtime failures
/// (a failed context operation, a stack allocation failure inside the
/// dispatch loop). Nothing is thrown; aborting keeps suspended fiber
/// stacks from unwinding in an undefined order.
pub fn fatal(msg: &str) -> ! {
    error!(
        target: "system",
        "FATAL: {msg}\nbacktrace:\n{}",
        backtrace_to_string(100, 2, "    ")
    );
    std::process::abort();
}
