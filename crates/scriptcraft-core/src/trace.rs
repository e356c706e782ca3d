pub use scriptcraft_types::{TokenUsage, Trace, TraceBuilder};

use std::cell::RefCell;

tokio::task_local! {
    static TRACES: RefCell<Vec<Trace>>;
}

/// Run `f` with a fresh trace scope and return its output together with every
/// trace recorded while it ran.
pub async fn collect_traces<F, R>(f: F) -> (R, Vec<Trace>)
where
    F: std::future::Future<Output = R>,
{
    TRACES
        .scope(RefCell::new(Vec::new()), async move {
            let output = f.await;
            let collected = TRACES.with(|t| t.take());
            (output, collected)
        })
        .await
}

/// Add a trace to the enclosing scope. Outside `collect_traces` this does nothing.
pub fn record_trace(trace: Trace) {
    let _ = TRACES.try_with(|traces| traces.borrow_mut().push(trace));
}
