//! A minimal host that live-loads native plugins.
//!
//! Every argument is a shared library built with `export_plugin!`; each one
//! is loaded with auto-reload enabled, so rebuilding a plugin swaps it in
//! while the host keeps running.
//!
//! Run with: cargo run --example host_loop -- target/debug/libgreeter.so

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use live_plugin_loader::{
    DirectoryConfigStore, HostContext, LifecycleEvent, LivePluginRuntime, NativeBackend,
    PluginRegistry, RuntimeConfig, TickOutcome,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = Arc::new(PluginRegistry::new());
    let host = HostContext::new("host-loop")
        .with_registry(registry.clone())
        .with_store(Arc::new(DirectoryConfigStore::new("./host-loop-config")));

    let mut runtime = LivePluginRuntime::start(
        &host,
        Arc::new(NativeBackend::new()?),
        RuntimeConfig::default(),
    )?;

    runtime.on_event(|event| match event {
        LifecycleEvent::Loaded { name, module, .. } => info!("{} is live ({})", name, module),
        LifecycleEvent::Unloaded { internal_name, .. } => info!("{} is gone", internal_name),
        other if other.is_failure() => warn!("{}: {:?}", other.event_name(), other),
        _ => {}
    });

    for path in std::env::args().skip(1).map(PathBuf::from) {
        let existing = runtime
            .settings()
            .iter()
            .find(|c| c.file_path == path)
            .map(|c| c.id());
        let id = match existing {
            Some(id) => id,
            None => runtime.add_plugin(&path)?,
        };
        runtime.set_auto_reload(id, true)?;
        runtime.request_load(id)?;
    }

    info!("Running. Rebuild a plugin to reload it; press Ctrl+C to exit.");

    loop {
        match runtime.tick() {
            TickOutcome::Idle => {}
            TickOutcome::Loaded { report, .. } => {
                info!("{} plugins registered from {}", registry.len(), report.module_name)
            }
            TickOutcome::LoadFailed { error, .. } => warn!("Load failed: {}", error),
            outcome => info!("{:?}", outcome),
        }

        for group in runtime.open_errors() {
            for error in &group.errors {
                warn!("{}: {}", group.plugin_name, error.detail);
            }
            if let Some(first) = group.errors.first() {
                runtime.close_error(first.id);
            }
        }

        std::thread::sleep(Duration::from_millis(250));
    }
}
