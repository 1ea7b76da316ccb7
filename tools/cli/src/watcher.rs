//! Bridge from `notify` file-system events to watcher notifications.

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use sitesync_sync::{ChangeKind, WatchEvent};

/// Watch `root` recursively.
///
/// Events arrive on the returned receiver until the watcher is dropped.
pub fn watch(root: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in convert(&event) {
                if tx.send(change).is_err() {
                    debug!("Watch receiver dropped");
                    return;
                }
            }
        }
        Err(e) => error!("File watcher error: {}", e),
    })
    .context("Failed to create file watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    info!("Started watching directory: {}", root.display());

    Ok((watcher, rx))
}

/// Translate one notify event; access and metadata-only events yield nothing.
pub fn convert(event: &Event) -> Vec<WatchEvent> {
    let paths = &event.paths;
    let each = |kind: ChangeKind, is_dir: bool| -> Vec<WatchEvent> {
        paths
            .iter()
            .map(|p| WatchEvent {
                path: p.clone(),
                kind,
                is_dir,
            })
            .collect()
    };

    match event.kind {
        EventKind::Create(kind) => {
            let is_dir = kind == CreateKind::Folder
                || (kind != CreateKind::File && paths.first().is_some_and(|p| p.is_dir()));
            each(ChangeKind::Created, is_dir)
        }
        EventKind::Remove(kind) => each(ChangeKind::Deleted, kind == RemoveKind::Folder),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeKind::Deleted, false),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .iter()
            .map(|p| WatchEvent {
                path: p.clone(),
                kind: ChangeKind::Created,
                is_dir: p.is_dir(),
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [from, to] => vec![
                WatchEvent {
                    path: from.clone(),
                    kind: ChangeKind::Deleted,
                    is_dir: to.is_dir(),
                },
                WatchEvent {
                    path: to.clone(),
                    kind: ChangeKind::Created,
                    is_dir: to.is_dir(),
                },
            ],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => each(ChangeKind::Changed, false),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange, MetadataKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_create_modify_remove() {
        let created = convert(&event(EventKind::Create(CreateKind::File), &["/w/a.html"]));
        assert_eq!(created, vec![WatchEvent::new("/w/a.html", ChangeKind::Created)]);

        let changed = convert(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/a.html"],
        ));
        assert_eq!(changed, vec![WatchEvent::new("/w/a.html", ChangeKind::Changed)]);

        let removed = convert(&event(EventKind::Remove(RemoveKind::Folder), &["/w/img"]));
        assert_eq!(removed, vec![WatchEvent::dir("/w/img", ChangeKind::Deleted)]);
    }

    #[test]
    fn test_rename_both_splits() {
        let events = convert(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.css", "/w/new.css"],
        ));
        assert_eq!(
            events,
            vec![
                WatchEvent::new("/w/old.css", ChangeKind::Deleted),
                WatchEvent::new("/w/new.css", ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_noise_is_dropped() {
        assert!(convert(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/w/a"]
        ))
        .is_empty());
        assert!(convert(&event(EventKind::Access(AccessKind::Any), &["/w/a"])).is_empty());
    }
}
