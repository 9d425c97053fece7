use autoshelve_core::{AutoShelve, ShelveEvent, ShelvesetResult};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Log line for a finished attempt; `None` when nothing was shelved.
pub fn describe(result: &ShelvesetResult, maximum: u16) -> Option<String> {
    if let Some(error) = &result.error {
        let name = if result.shelveset_name.is_empty() {
            "shelveset"
        } else {
            result.shelveset_name.as_str()
        };
        return Some(format!("Failed to create {}: {}", name, error));
    }
    if result.change_count == 0 {
        return None;
    }

    let mut line = format!(
        "Shelved {} pending changes to {}",
        result.change_count, result.shelveset_name
    );
    if result.purge_count > 0 {
        line.push_str(&format!(
            "; maximum of {} reached, deleted {} old shelvesets",
            maximum, result.purge_count
        ));
    }
    Some(line)
}

/// Log one engine notification.
pub fn log_event(event: &ShelveEvent, maximum: u16) {
    match event {
        ShelveEvent::Started => info!("Auto Shelve running"),
        ShelveEvent::Stopped => info!("Auto Shelve stopped"),
        ShelveEvent::ShelvesetCreated(result) => {
            if let Some(line) = describe(result, maximum) {
                if result.is_success() {
                    info!("{}", line);
                } else {
                    warn!("{}", line);
                }
            }
        }
        ShelveEvent::ConnectionError(e) => warn!("Auto Shelve stopped, cannot connect: {}", e),
        ShelveEvent::ShelvesetError(e) => warn!("Shelving failed: {}", e),
    }
}

/// Whether `event` reports a failure.
pub fn is_failure(event: &ShelveEvent) -> bool {
    match event {
        ShelveEvent::ShelvesetCreated(result) => !result.is_success(),
        ShelveEvent::ConnectionError(_) | ShelveEvent::ShelvesetError(_) => true,
        ShelveEvent::Started | ShelveEvent::Stopped => false,
    }
}

/// Log every engine notification.
pub fn spawn_reporter(engine: &AutoShelve) -> JoinHandle<()> {
    let mut rx = engine.subscribe();
    let engine = engine.clone();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event, engine.maximum_shelvesets()),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Reporter fell behind, {} notifications dropped", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
