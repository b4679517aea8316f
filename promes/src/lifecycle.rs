//! Index templates, the initial index, and periodic rollover.
//!
//! Writes always address the write alias; the alias points at exactly one
//! concrete index generation at a time (`<alias>-000001`, `-000002`, ...).
//! Every generation is created from the same template, so all of them
//! share the sample mapping and join the search alias the read path
//! queries.
//!
//! Rollover is delegated to the backend's conditional rollover call: the
//! backend evaluates the age, document-count and size conditions against
//! the current write index and swaps the alias atomically, so writers never
//! observe an alias without a write index.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, select};
use tracing::{Span, debug, error, info, info_span};

use crate::backend::{CreateIndex, DocumentStore, IndexTemplate, RolloverRequest};
use crate::config::IndexConfig;
use crate::error::{BackendError, LifecycleError, Result};

/// Returns the name of the first index generation for `alias`.
pub fn initial_index_name(alias: &str) -> String {
    format!("{alias}-000001")
}

/// Result of one rollover evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// No rollover condition is configured; the backend was not called.
    Disabled,
    /// No condition held; the write index is unchanged.
    NotNeeded {
        /// The current write index.
        index: String,
    },
    /// The alias now points at a new index.
    RolledOver {
        /// The previous write index, still searchable.
        old_index: String,
        /// The new write index.
        new_index: String,
    },
}

/// Registers the template and creates the first index if the write alias
/// does not exist yet.
///
/// Running it again against a bootstrapped store only overwrites the
/// template with the same definition.
///
/// # Errors
///
/// Returns [`LifecycleError::Bootstrap`] naming the step that failed.
pub fn bootstrap(store: &dyn DocumentStore, config: &IndexConfig) -> Result<()> {
    let alias = &config.alias;
    let failed = |step: &'static str| {
        move |e: BackendError| LifecycleError::Bootstrap {
            alias: alias.clone(),
            step,
            source: e,
        }
    };

    store
        .put_template(alias, &IndexTemplate::for_config(config))
        .map_err(failed("template"))?;

    if store.exists(alias).map_err(failed("alias lookup"))? {
        debug!(alias = %alias, "write alias already exists");
        return Ok(());
    }

    let index = initial_index_name(alias);
    store
        .create_index(&index, &CreateIndex::with_write_alias(alias.as_str()))
        .map_err(failed("initial index"))?;
    info!(alias = %alias, index = %index, "created initial index");
    Ok(())
}

/// Evaluates rollover conditions against one store.
struct Roller {
    store: Arc<dyn DocumentStore>,
    config: IndexConfig,
}

impl Roller {
    fn tick(&self) -> Result<RolloverOutcome> {
        if self.config.rollover.is_empty() {
            return Ok(RolloverOutcome::Disabled);
        }

        let request = RolloverRequest {
            conditions: self.config.rollover.clone(),
        };
        let response = self.store.rollover(&self.config.alias, &request)?;

        if response.rolled_over {
            info!(
                old_index = %response.old_index,
                new_index = %response.new_index,
                conditions = ?response.conditions,
                "rolled over write alias"
            );
            Ok(RolloverOutcome::RolledOver {
                old_index: response.old_index,
                new_index: response.new_index,
            })
        } else {
            debug!(index = %response.old_index, conditions = ?response.conditions, "rollover not needed");
            Ok(RolloverOutcome::NotNeeded {
                index: response.old_index,
            })
        }
    }
}

/// Bootstraps the write alias and rolls it over on a fixed interval.
pub struct IndexLifecycleManager {
    roller: Arc<Roller>,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    span: Span,
}

impl fmt::Debug for IndexLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexLifecycleManager")
            .field("config", &self.roller.config)
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl IndexLifecycleManager {
    /// Bootstraps the alias, then starts the rollover thread.
    ///
    /// # Errors
    ///
    /// Returns a config error for an invalid configuration,
    /// [`LifecycleError::Bootstrap`] if the template or initial index
    /// cannot be created, or [`LifecycleError::Spawn`] if the rollover
    /// thread cannot be started.
    pub fn start(store: Arc<dyn DocumentStore>, config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let span = info_span!("index_lifecycle", alias = %config.alias);
        span.in_scope(|| bootstrap(store.as_ref(), &config))?;

        let roller = Arc::new(Roller { store, config });
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(1);

        let loop_roller = Arc::clone(&roller);
        let loop_span = span.clone();
        let interval = roller.config.check_interval;
        let handle = std::thread::Builder::new()
            .name("promes-rollover".to_string())
            .spawn(move || {
                let _enter = loop_span.enter();
                loop {
                    select! {
                        recv(cancelled) -> _ => break,
                        default(interval) => match loop_roller.tick() {
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "rollover failed, retrying next interval"),
                        },
                    }
                }
                debug!("rollover loop stopped");
            })
            .map_err(|e| LifecycleError::Spawn { source: e })?;

        span.in_scope(|| {
            info!(
                interval_secs = interval.as_secs(),
                conditions = ?roller.config.rollover,
                "index lifecycle started"
            );
        });

        Ok(Self {
            roller,
            cancel: Some(cancel),
            handle: Some(handle),
            span,
        })
    }

    /// Runs one rollover evaluation now.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the rollover call fails.
    pub fn tick(&self) -> Result<RolloverOutcome> {
        let _enter = self.span.enter();
        self.roller.tick()
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.roller.config
    }

    /// Cancels the rollover loop and waits for it to exit. No final
    /// rollover is attempted.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            self.span.in_scope(|| error!("rollover thread panicked"));
        }
    }
}

impl Drop for IndexLifecycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::MemoryStore;
    use crate::config::RolloverConditions;
    use crate::error::PromesError;

    fn config() -> IndexConfig {
        IndexConfig::new("m").with_check_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_bootstrap_creates_initial_index() {
        let store = MemoryStore::new();
        bootstrap(&store, &config()).unwrap();
        assert_eq!(store.index_names(), vec!["m-000001".to_string()]);
        assert_eq!(store.write_index("m").as_deref(), Some("m-000001"));
        assert!(store.exists("m-search").unwrap());
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let store = MemoryStore::new();
        bootstrap(&store, &config()).unwrap();
        bootstrap(&store, &config()).unwrap();
        assert_eq!(store.index_names().len(), 1);
    }

    #[test]
    fn test_bootstrap_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let err = IndexLifecycleManager::start(store, config()).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            PromesError::Lifecycle(LifecycleError::Bootstrap {
                step: "template",
                ..
            })
        ));
    }

    #[test]
    fn test_tick_disabled_without_conditions() {
        let store = Arc::new(MemoryStore::new());
        let manager = IndexLifecycleManager::start(
            store,
            config().with_rollover(RolloverConditions::default()),
        )
        .unwrap();
        assert_eq!(manager.tick().unwrap(), RolloverOutcome::Disabled);
    }

    #[test]
    fn test_tick_not_needed() {
        let store = Arc::new(MemoryStore::new());
        let manager = IndexLifecycleManager::start(store, config()).unwrap();
        assert_eq!(
            manager.tick().unwrap(),
            RolloverOutcome::NotNeeded {
                index: "m-000001".to_string()
            }
        );
    }

    #[test]
    fn test_tick_error_is_returned() {
        let store = Arc::new(MemoryStore::new());
        let manager = IndexLifecycleManager::start(store.clone(), config()).unwrap();
        store.set_unavailable(true);
        let err = manager.tick().unwrap_err();
        assert!(matches!(err, PromesError::Backend(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut manager = IndexLifecycleManager::start(store, config()).unwrap();
        let started = std::time::Instant::now();
        manager.stop();
        manager.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_loop_rolls_over_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let config = IndexConfig::new("m")
            .with_check_interval(Duration::from_millis(20))
            .with_rollover(RolloverConditions {
                max_docs: Some(1),
                ..RolloverConditions::default()
            });
        let _manager = IndexLifecycleManager::start(store.clone(), config).unwrap();

        let doc = crate::series::SampleDocument {
            label: crate::series::Labels::from_pairs([("__name__", "up")]),
            value: 1.0,
            timestamp: 1,
        };
        store
            .bulk(&[crate::backend::BulkOperation::new("m", &doc).unwrap()])
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.write_index("m").as_deref() != Some("m-000002") {
            assert!(std::time::Instant::now() < deadline, "rollover never happened");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
