//! Desktop notifications for newly discovered items.
//!
//! Delivery goes through the native notification service. Failures are
//! reported to the caller, which logs them and moves on.

use crate::error::PollError;
use crate::models::RemoteItem;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// A notification to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub subtitle: String,
    pub body: String,

    /// Click-through link. Empty when the item has no web page.
    pub url: String,
}

impl Notification {
    /// The "new item" notification for `item`.
    pub fn new_item(item: &RemoteItem) -> Self {
        let subtitle = match &item.author_name {
            Some(author) => format!("by {}", author),
            None => format!("{} {}", item.kind, item.identity),
        };

        Self {
            title: format!("New {}", item.kind),
            subtitle,
            body: item.title.clone(),
            url: item.web_url.clone(),
        }
    }
}

/// Fire-and-forget notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), PollError>;
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PollError> {
        log::debug!("Notification suppressed: {}", notification.title);
        Ok(())
    }
}

/// Application name shown by the notification server.
pub const APP_NAME: &str = "gitlab-poller";

/// Action id of a click on the notification body.
const OPEN_ACTION: &str = "default";

/// Shows OS-level notifications through `notify-rust`.
///
/// Clicking a notification opens its URL where the notification server
/// reports actions (freedesktop). Elsewhere the URL is appended to the body.
#[derive(Debug, Clone, Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    /// The native notification shown for `notification`.
    pub fn toast(notification: &Notification) -> notify_rust::Notification {
        let mut toast = notify_rust::Notification::new();
        toast
            .appname(APP_NAME)
            .summary(&notification.title)
            .subtitle(&notification.subtitle);

        if cfg!(target_os = "macos") {
            if notification.url.is_empty() {
                toast.body(&notification.body);
            } else {
                toast.body(&format!("{}\n{}", notification.body, notification.url));
            }
        } else {
            // freedesktop servers have no subtitle line
            toast.body(&format!("{}\n{}", notification.subtitle, notification.body));
        }

        if !notification.url.is_empty() {
            toast.action(OPEN_ACTION, "Open");
        }
        toast
    }
}

/// Open `url` once the notification is clicked. Blocks until it is closed.
#[cfg(all(unix, not(target_os = "macos")))]
fn open_on_click(handle: notify_rust::NotificationHandle, url: &str) {
    if url.is_empty() {
        return;
    }
    handle.wait_for_action(|action| {
        if action == OPEN_ACTION {
            if let Err(e) = open::that(url) {
                log::warn!("Failed to open {}: {}", url, e);
            }
        }
    });
}

#[cfg(not(all(unix, not(target_os = "macos"))))]
fn open_on_click<H>(_handle: H, _url: &str) {}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PollError> {
        let toast = Self::toast(notification);
        let url = notification.url.clone();
        let (shown_tx, shown_rx) = oneshot::channel();

        // Detached: the click wait can outlive the cycle
        std::thread::Builder::new()
            .name("notification".to_string())
            .spawn(move || match toast.show() {
                Ok(handle) => {
                    let _ = shown_tx.send(Ok(()));
                    open_on_click(handle, &url);
                }
                Err(e) => {
                    let _ = shown_tx.send(Err(e.to_string()));
                }
            })
            .map_err(|e| PollError::notification(format!("Failed to start notification thread: {}", e)))?;

        match shown_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PollError::notification(format!("Failed to send notification: {}", e))),
            Err(_) => Err(PollError::notification("Notification thread exited early")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> Notification {
        Notification {
            title: "New merge request".to_string(),
            subtitle: "by John \"JD\" Doe".to_string(),
            body: "Add poller".to_string(),
            url: "https://gitlab.example.com/g/p/-/merge_requests/1".to_string(),
        }
    }

    #[test]
    fn test_toast_carries_title_and_open_action() {
        let toast = DesktopNotifier::toast(&notification());

        assert_eq!(toast.appname, APP_NAME);
        assert_eq!(toast.summary, "New merge request");
        assert_eq!(toast.subtitle.as_deref(), Some("by John \"JD\" Doe"));
        assert!(toast.body.contains("Add poller"));
        assert_eq!(toast.actions, vec![OPEN_ACTION.to_string(), "Open".to_string()]);
    }

    #[test]
    fn test_toast_without_url_has_no_action() {
        let mut plain = notification();
        plain.url = String::new();

        let toast = DesktopNotifier::toast(&plain);
        assert!(toast.actions.is_empty());
        assert!(!toast.body.contains("https://"));
    }

    #[test]
    fn test_new_item_notification() {
        let item = RemoteItem {
            kind: crate::models::ItemKind::MergeRequest,
            identity: crate::models::Identity::Scoped {
                project_id: 10,
                local_sequence: 1,
            },
            global_id: 1,
            project_id: Some(10),
            local_sequence: Some(1),
            title: "Add poller".to_string(),
            description: String::new(),
            state: "opened".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            author_id: 7,
            author_name: Some("John Doe".to_string()),
            reviewer: None,
            web_url: "https://gitlab.example.com/g/p/-/merge_requests/1".to_string(),
            payload: serde_json::Value::Null,
        };

        let n = Notification::new_item(&item);
        assert_eq!(n.title, "New merge request");
        assert_eq!(n.subtitle, "by John Doe");
        assert_eq!(n.url, item.web_url);
    }

    #[tokio::test]
    async fn test_noop_notifier_succeeds() {
        assert!(NoopNotifier.notify(&notification()).await.is_ok());
    }
}
