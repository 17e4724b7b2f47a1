use std::future::Future;

use b_x::BX;

pub(crate) mod peer;
pub(crate) mod tracing_common;

/// Runs `test` on a single-threaded runtime, inside a `LocalSet` so that
/// sessions can spawn their drivers.
pub(crate) fn run(test: impl Future<Output = Result<(), BX>>) {
    run_on(tokio::runtime::Builder::new_current_thread(), test)
}

/// Like [run], with the clock paused: it jumps ahead whenever every task is
/// waiting on a timer.
pub(crate) fn run_paused(test: impl Future<Output = Result<(), BX>>) {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.start_paused(true);
    run_on(builder, test)
}

fn run_on(mut builder: tokio::runtime::Builder, test: impl Future<Output = Result<(), BX>>) {
    let rt = builder.enable_all().build().unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async {
        tracing_common::setup_tracing();

        if let Err(e) = test.await {
            panic!("Error: {e}");
        }
    });
}
