//! Autocmd-backed event publisher
//!
//! Registers a server-side autocmd that re-evaluates a list of expressions
//! and forwards the results as a notification under a synthetic event name.
//! Teardown is two steps: delete the autocmd by the id the remote assigned
//! at registration, then unsubscribe from the synthetic event.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::api::{ApiError, AutocmdOptions, NvimApi};
use crate::events::dispatcher::RemoteInterest;

pub struct AutocmdInterest {
    api: NvimApi,
    source_events: Vec<String>,
    arguments: Vec<String>,
    registrations: Mutex<HashMap<String, i64>>,
}

impl AutocmdInterest {
    /// Publish `arguments` (Vimscript expressions) whenever one of
    /// `source_events` fires
    pub fn new(
        api: NvimApi,
        source_events: impl IntoIterator<Item = impl Into<String>>,
        arguments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            api,
            source_events: source_events.into_iter().map(Into::into).collect(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Remote id of the autocmd publishing `event`, if registered
    pub fn registration(&self, event: &str) -> Option<i64> {
        self.registrations.lock().unwrap().get(event).copied()
    }
}

/// Ex command forwarding the evaluated arguments as notification `event`
pub fn rpcnotify_command(event: &str, arguments: &[String]) -> String {
    let mut command = format!("call rpcnotify(0, '{}'", event.replace('\'', "''"));
    for argument in arguments {
        command.push_str(", ");
        command.push_str(argument);
    }
    command.push(')');
    command
}

#[async_trait]
impl RemoteInterest for AutocmdInterest {
    async fn register(&self, event: &str) -> Result<(), ApiError> {
        self.api.subscribe(event).await?;

        let options = AutocmdOptions {
            desc: Some(format!("publish {event}")),
            ..AutocmdOptions::command(rpcnotify_command(event, &self.arguments))
        };
        match self.api.create_autocmd(&self.source_events, &options).await {
            Ok(id) => {
                debug!("AutocmdInterest: autocmd {} publishes {}", id, event);
                self.registrations
                    .lock()
                    .unwrap()
                    .insert(event.to_string(), id);
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = self.api.unsubscribe(event).await {
                    warn!("AutocmdInterest: rollback of {} failed: {}", event, undo);
                }
                Err(e)
            }
        }
    }

    async fn unregister(&self, event: &str) -> Result<(), ApiError> {
        let registration = self.registrations.lock().unwrap().remove(event);
        if let Some(id) = registration {
            self.api.del_autocmd(id).await?;
        }
        self.api.unsubscribe(event).await
    }
}
