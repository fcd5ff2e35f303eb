use std::sync::Arc;

use tally_core::projection::ViewCache;
use tally_core::sync::{NetworkMonitor, SyncRuntime};

use crate::commands::common::{format_ledger_lines, parse_day, Context};
use crate::error::CliError;

/// Run the sync runtime in the foreground until Ctrl-C, printing the
/// ledger of `day` every time it changes.
pub async fn run_watch(day: Option<&str>, context: &Context) -> Result<(), CliError> {
    let day = parse_day(day)?;
    let store = context.open_store().await?;
    let view = ViewCache::new(store.clone());
    let engine = context.engine_with_view(store, view.clone())?;
    let feed = context.config.change_feed()?;
    let network = NetworkMonitor::new(true, context.config.reconnect_debounce());

    let bootstrap = engine.bootstrap().await?;
    if let Some(restored) = &bootstrap.restored {
        println!("Restored from remote: {restored}");
    }
    let mut updates = view.subscribe();
    let mut connectivity = network.subscribe();
    let runtime = SyncRuntime::new(
        engine,
        Arc::new(feed),
        network,
        context.config.runtime_options(),
    );
    let live = runtime.start().await;
    println!("Watching {day} with {live} live subscriptions. Press Ctrl-C to stop.");
    for line in format_ledger_lines(&view.select_day(day).await?) {
        println!("{line}");
    }
    updates.mark_unchanged();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if let Some(ledger) = snapshot {
                    println!();
                    for line in format_ledger_lines(&ledger) {
                        println!("{line}");
                    }
                }
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connectivity.borrow_and_update() {
                    println!("Back online");
                } else {
                    println!("Remote unreachable; changes stay queued");
                }
            }
        }
    }

    runtime.stop();
    let status = runtime.status().await?;
    println!(
        "Stopped ({}), {} records waiting for upload",
        status.state,
        status.dirty_total()
    );
    Ok(())
}
