//! Generic module host.
//!
//! Owns the transport, the data broker, the persisted configs and the job
//! manager; answers the controller's queries; drives the sampling/capture
//! state machine through the module's hooks. A module implements
//! [`IoModule`] and never touches the bus handshake itself.

use crate::broker::DataBroker;
use crate::jobs::{Job, JobManager};
use async_trait::async_trait;
use databeam_bus::{Bus, BusQueryable, BusSubscriber, DEFAULT_QUERY_TIMEOUT};
use databeam_core::messages::{
    DocumentationReply, ExternalDataBeamQuery, ExternalDataBeamReply, GetSchemasReply,
    MeasurementInfo, ModuleConfigCmd, ModuleConfigEvent, ModuleConfigEventReply,
    ModuleConfigQuery, ModuleConfigReply, ModuleDataConfigCmd, ModuleDataConfigQuery,
    ModuleDataConfigReply, ModuleIdentity, ModuleRegistryCmd, ModuleRegistryQuery,
    ModuleRegistryReply, StartStop, StartStopCmd, StartStopReply, Status,
};
use databeam_core::{fs, DataConfigStore, DataSchema, EnvConfig, TimeSource};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONFIG_BACKUPS_TO_KEEP: usize = 10;

/// Services the host hands to a module at init time.
#[derive(Clone)]
pub struct ModuleContext {
    pub bus: Arc<dyn Bus>,
    pub broker: Arc<DataBroker>,
    pub db_id: String,
}

/// The contract a module implements. Hooks default to no-ops so simple
/// sources only override what they need.
#[async_trait]
pub trait IoModule: Send + Sync {
    fn name(&self) -> &str;
    fn module_type(&self) -> &str;

    /// Called once before the initial config is applied.
    async fn init(&self, ctx: ModuleContext);

    fn default_config(&self) -> String;
    fn get_config(&self) -> String;

    /// `None` accepts the config, `Some(reason)` rejects it.
    fn validate_config(&self, _cfg: &Value) -> Option<String> {
        None
    }
    async fn apply_config(&self, _cfg: &Value) {}

    fn schemas(&self) -> Vec<DataSchema>;

    /// Extra fields for the measurement metadata file.
    fn metadata(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn config_event(&self, _cfg_key: &str) {}
    async fn event_in(&self, _payload: &str) {}

    async fn prepare_start_sampling(&self) -> bool {
        true
    }
    async fn start_sampling(&self) -> bool {
        true
    }
    async fn prepare_stop_sampling(&self) -> bool {
        true
    }
    async fn stop_sampling(&self) -> bool {
        true
    }
    async fn prepare_start_capture(&self) -> bool {
        true
    }
    async fn start_capture(&self) -> bool {
        true
    }
    async fn prepare_stop_capture(&self) -> bool {
        true
    }
    async fn stop_capture(&self) -> bool {
        true
    }
}

pub struct ModuleHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    module: Arc<dyn IoModule>,
    bus: Arc<dyn Bus>,
    broker: Arc<DataBroker>,
    data_config: Arc<DataConfigStore>,
    jobs: Arc<JobManager>,
    ready_job: Arc<Job>,
    db_id: String,
    module_name: String,
    module_type: String,
    controller: String,
    data_dir: PathBuf,
    module_config_dir: PathBuf,
    module_config_file: PathBuf,
    documentation: String,
    sampling_before_capture: AtomicBool,
    token: CancellationToken,
}

impl ModuleHost {
    pub fn new(
        module: Arc<dyn IoModule>,
        env: &EnvConfig,
        bus: Arc<dyn Bus>,
        token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let db_id = env.get("DB_ID");
        if db_id.is_empty() {
            anyhow::bail!("DB_ID not set");
        }
        let module_name = module.name().to_string();
        let module_type = module.module_type().to_string();

        let data_dir = PathBuf::from(env.get("DATA_DIR")).join(env.get("DEPLOY_VERSION"));
        let config_dir = PathBuf::from(env.get("CONFIG_DIR")).join(env.get("DEPLOY_VERSION"));
        let module_config_dir = config_dir.join(format!("{module_type}-{module_name}"));
        let module_config_file = module_config_dir.join("config.json");
        let module_data_config_file = module_config_dir.join("data_config.json");

        let documentation = fs::read_to_string_opt(Path::new("documentation.html"))
            .ok()
            .flatten()
            .unwrap_or_else(|| "<p>No documentation provided.</p>".to_string());

        let data_config = Arc::new(DataConfigStore::load(module_data_config_file));
        let broker = DataBroker::new(bus.clone(), data_config.clone(), &db_id, &module_name);
        let jobs = JobManager::new(bus.clone(), &db_id);
        let ready_job = Job::ready(&module_name);

        Ok(Self {
            inner: Arc::new(HostInner {
                module,
                bus,
                broker,
                data_config,
                jobs,
                ready_job,
                controller: format!("{db_id}/c"),
                db_id,
                module_name,
                module_type,
                data_dir,
                module_config_dir,
                module_config_file,
                documentation,
                sampling_before_capture: AtomicBool::new(false),
                token,
            }),
        })
    }

    pub fn broker(&self) -> Arc<DataBroker> {
        self.inner.broker.clone()
    }

    /// Handshake with the controller, serve queries, re-register until a
    /// shutdown signal arrives, then tear everything down in order.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.spawn_signal_task();
        let inner = &self.inner;

        inner.wait_for_controller().await;
        if !inner.token.is_cancelled() {
            inner.fetch_external_databeams().await;
            inner.prepare_module().await?;
            HostInner::declare_handlers(inner).await;
            inner.set_ready_state(true);
            info!(module = %inner.module_name, "module ready");

            while !inner.token.is_cancelled() {
                inner.register_module().await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = inner.token.cancelled() => {}
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_signal_task(&self) {
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = terminate.recv() => info!("terminate received"),
                _ = token.cancelled() => return,
            }
            token.cancel();
        });
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        info!(module = %inner.module_name, "module shutdown");

        inner.ready_job.set_done(true);
        inner.jobs.update(&inner.ready_job);
        inner.jobs.shutdown().await;

        if inner.broker.sampling_running() {
            inner.broker.stop_sampling();
            inner.module.prepare_stop_sampling().await;
            inner.module.stop_sampling().await;
        }
        if inner.broker.capture_running() {
            inner.module.prepare_stop_capture().await;
            inner.module.stop_capture().await;
            inner.broker.stop_capture();
        }

        inner.unregister_module().await;
        inner.broker.shutdown().await;
        inner.bus.shutdown().await;
        info!(module = %inner.module_name, "module shutdown complete");
    }
}

impl HostInner {
    async fn wait_for_controller(&self) {
        debug!("waiting for controller");
        while !self.token.is_cancelled() {
            let reply = self
                .bus
                .query(&self.controller, "ping", "", DEFAULT_QUERY_TIMEOUT)
                .await;
            if !reply.is_empty() {
                debug!(%reply, "controller reachable");
                return;
            }
            warn!("controller not reachable, retrying");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.token.cancelled() => {}
            }
        }
    }

    async fn fetch_external_databeams(&self) {
        let query = to_json(&ExternalDataBeamQuery::default());
        let reply = self
            .bus
            .query(&self.controller, "databeam_registry", &query, DEFAULT_QUERY_TIMEOUT)
            .await;
        if reply.is_empty() {
            error!("could not fetch external deployments from controller");
            return;
        }
        match serde_json::from_str::<ExternalDataBeamReply>(&reply) {
            Ok(registry) => {
                self.bus
                    .set_external_databeams(registry.db_id_list, registry.hostname_list)
                    .await;
            }
            Err(e) => error!(error = %e, "invalid databeam registry reply"),
        }
    }

    /// Create the config directory, persist the default config on first
    /// run, apply the stored config and announce the schemas.
    async fn prepare_module(&self) -> anyhow::Result<()> {
        fs::create_directory(&self.module_config_dir)?;

        let cfg_text = match fs::read_to_string_opt(&self.module_config_file)? {
            Some(text) => text,
            None => {
                let default = self.module.default_config();
                fs::write_string(&self.module_config_file, &default)?;
                default
            }
        };

        self.module
            .init(ModuleContext {
                bus: self.bus.clone(),
                broker: self.broker.clone(),
                db_id: self.db_id.clone(),
            })
            .await;

        match serde_json::from_str::<Value>(&cfg_text) {
            Ok(cfg) => {
                if let Some(reason) = self.set_module_config(&cfg).await {
                    error!(%reason, "error on initial config");
                }
            }
            Err(e) => error!(error = %e, "stored config is not valid JSON"),
        }

        self.broker.set_schemas(&self.resolved_schemas()).await;
        Ok(())
    }

    async fn declare_handlers(host: &Arc<Self>) {
        debug!("declaring queryables and subscriptions");
        let queryable: Arc<dyn BusQueryable> = host.clone();
        for topic in [
            "ping",
            "config",
            "config_event",
            "data_config",
            "sampling",
            "prepare_sampling",
            "stop_sampling",
            "prepare_capture",
            "stop_capture",
            "get_latest",
            "get_schemas",
            "get_metadata",
            "get_docu",
        ] {
            host.bus.declare_queryable(topic, queryable.clone()).await;
        }

        let subscriber: Arc<dyn BusSubscriber> = host.clone();
        let prefix = format!("{}/m/{}", host.db_id, host.module_name);
        host.bus
            .subscribe(&format!("{prefix}/event_in"), subscriber.clone())
            .await;
        host.bus
            .subscribe(
                &format!("{}/c/bc/start_capture", host.db_id),
                subscriber.clone(),
            )
            .await;
        host.bus
            .subscribe(&format!("{}/c/bc/start_sampling", host.db_id), subscriber)
            .await;
    }

    async fn register_module(&self) {
        let query = ModuleRegistryQuery {
            cmd: ModuleRegistryCmd::Register,
            module: ModuleIdentity {
                name: self.module_name.clone(),
                module_type: self.module_type.clone(),
            },
        };
        let reply = self
            .bus
            .query(
                &self.controller,
                "module_registry",
                &to_json(&query),
                DEFAULT_QUERY_TIMEOUT,
            )
            .await;
        if reply.is_empty() {
            error!("register: could not reach controller");
        } else if let Ok(parsed) = serde_json::from_str::<ModuleRegistryReply>(&reply) {
            if parsed.status.error {
                error!(message = %parsed.status.message, "register rejected");
            }
        }
    }

    async fn unregister_module(&self) {
        debug!("unregister module");
        let query = ModuleRegistryQuery {
            cmd: ModuleRegistryCmd::Remove,
            module: ModuleIdentity {
                name: self.module_name.clone(),
                module_type: self.module_type.clone(),
            },
        };
        let reply = self
            .bus
            .query(
                &self.controller,
                "module_registry",
                &to_json(&query),
                DEFAULT_QUERY_TIMEOUT,
            )
            .await;
        if reply.is_empty() {
            error!("unregister: could not reach controller");
        }
    }

    /// The module's schemas; a module that declares none gets a single
    /// default schema publishing under its own name.
    fn resolved_schemas(&self) -> Vec<DataSchema> {
        let schemas = self.module.schemas();
        if !schemas.is_empty() {
            return schemas;
        }
        let mut default = DataSchema::new();
        default.set_topic(&self.module_name);
        vec![default]
    }

    fn set_ready_state(&self, ready: bool) {
        if self.ready_job.ready_state() == ready {
            return;
        }
        self.ready_job.set_ready(ready);
        self.jobs.update(&self.ready_job);
    }

    /// Validate then apply; `None` means accepted.
    async fn set_module_config(&self, cfg: &Value) -> Option<String> {
        if let Some(reason) = self.module.validate_config(cfg) {
            debug!(%reason, "config invalid");
            return Some(reason);
        }
        self.module.apply_config(cfg).await;
        None
    }

    async fn handle_start_sampling(&self) -> bool {
        if self.broker.sampling_running() {
            debug!("sampling already running");
            return false;
        }
        self.broker.start_sampling();
        self.module.start_sampling().await;
        debug!("sampling started");
        true
    }

    async fn handle_stop_sampling(&self) -> bool {
        if !self.broker.sampling_running() {
            debug!("sampling not running");
            return false;
        }
        self.broker.stop_sampling();
        self.module.prepare_stop_sampling().await;
        self.module.stop_sampling().await;
        debug!("sampling stopped");
        true
    }

    async fn handle_config(&self, payload: &str) -> String {
        let Ok(query) = serde_json::from_str::<ModuleConfigQuery>(payload) else {
            return to_json(&ModuleConfigReply {
                status: Status::err("Config", "malformed request"),
                cfg_json: String::new(),
            });
        };
        match query.cmd {
            ModuleConfigCmd::Set => {
                debug!("set config");
                let result = match serde_json::from_str::<Value>(&query.cfg_json) {
                    Ok(cfg) => {
                        let result = self.set_module_config(&cfg).await;
                        if result.is_none() {
                            self.persist_config(&cfg);
                        }
                        result
                    }
                    Err(e) => Some(format!("config is not valid JSON: {e}")),
                };
                to_json(&ModuleConfigReply {
                    status: Status {
                        error: result.is_some(),
                        title: "Set Config".to_string(),
                        message: result.unwrap_or_default(),
                    },
                    cfg_json: String::new(),
                })
            }
            ModuleConfigCmd::Get => to_json(&ModuleConfigReply {
                status: Status::ok(),
                cfg_json: self.module.get_config(),
            }),
            ModuleConfigCmd::GetDefault => to_json(&ModuleConfigReply {
                status: Status::ok(),
                cfg_json: self.module.default_config(),
            }),
            ModuleConfigCmd::Unspecified => {
                debug!("config query unspecified");
                to_json(&ModuleConfigReply {
                    status: Status::err("Config", "unspecified command"),
                    cfg_json: String::new(),
                })
            }
        }
    }

    /// Rewrite `config.json` iff the pretty-printed form differs
    /// byte-for-byte from the file, and keep a bounded trail of
    /// timestamped backups.
    fn persist_config(&self, cfg: &Value) {
        let pretty = match serde_json::to_string_pretty(cfg) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "config serialization failed");
                return;
            }
        };
        let path_ok = check_config_path(&self.module_config_dir, &self.module_config_file);
        if path_ok && !has_config_changed(&self.module_config_file, &pretty) {
            return;
        }
        if let Err(e) = fs::write_string(&self.module_config_file, &pretty) {
            error!(error = %e, "could not write config file");
            return;
        }
        if let Err(e) = backup_config(&self.module_config_dir, &pretty, CONFIG_BACKUPS_TO_KEEP) {
            error!(error = %e, "could not write config backup");
        }
    }

    async fn handle_data_config(&self, payload: &str) -> String {
        let Ok(query) = serde_json::from_str::<ModuleDataConfigQuery>(payload) else {
            return to_json(&ModuleDataConfigReply {
                status: Status::err("DataConfig", "malformed request"),
                module_data_config: self.data_config.get(),
            });
        };
        match query.cmd {
            ModuleDataConfigCmd::Get => {
                debug!("data config get");
                to_json(&ModuleDataConfigReply {
                    status: Status::ok(),
                    module_data_config: self.data_config.get(),
                })
            }
            ModuleDataConfigCmd::Set => {
                debug!("data config set");
                let status = match self.data_config.store(query.module_data_config) {
                    Ok(()) => Status::ok(),
                    Err(e) => Status::err("DataConfig", e.to_string()),
                };
                to_json(&ModuleDataConfigReply {
                    status,
                    module_data_config: self.data_config.get(),
                })
            }
            ModuleDataConfigCmd::Unspecified => {
                debug!("data config unspecified");
                to_json(&ModuleDataConfigReply {
                    status: Status::err("DataConfig", "unspecified command"),
                    module_data_config: self.data_config.get(),
                })
            }
        }
    }

    async fn handle_prepare_capture(&self, payload: &str) -> String {
        if self.broker.capture_running() {
            warn!("prepare_capture: capture already running");
            return to_json(&Status::ok());
        }
        if !self.broker.sampling_running() {
            self.module.prepare_start_sampling().await;
            self.sampling_before_capture.store(false, Ordering::SeqCst);
            debug!("prepare_capture: sampling prepared");
        } else {
            self.sampling_before_capture.store(true, Ordering::SeqCst);
        }

        let info: MeasurementInfo = serde_json::from_str(payload).unwrap_or_default();
        debug!(
            name = %info.name,
            run_id = info.run_id,
            run_tag = %info.run_tag,
            "prepare capture"
        );

        let measurement_dir = self.data_dir.join(&info.name).join(&self.module_name);
        if let Err(e) = fs::create_directory(&measurement_dir) {
            error!(error = %e, "could not create measurement directory");
        }
        let meta_file = measurement_dir.join("module_meta.json");
        if let Err(e) = fs::write_string(&meta_file, &self.metadata_template()) {
            error!(error = %e, "could not write module metadata");
        }

        let schemas = self.resolved_schemas();
        if let Err(e) = self.broker.prepare_capture(
            &self.module_name,
            &self.module_type,
            &measurement_dir,
            &schemas,
        ) {
            error!(error = %e, "prepare capture failed");
        }
        self.module.prepare_start_capture().await;
        debug!("capture prepared");
        to_json(&Status::ok())
    }

    async fn handle_stop_capture(&self, payload: &str) -> String {
        let cmd = serde_json::from_str::<StartStop>(payload)
            .map(|s| s.cmd)
            .unwrap_or(StartStopCmd::Unspecified);
        let mut error = false;
        match cmd {
            StartStopCmd::Stop => {
                if self.broker.capture_running() {
                    self.broker.stop_capture();
                    debug!("capture stopped");
                    let keep_sampling = self.sampling_before_capture.swap(false, Ordering::SeqCst);
                    if !keep_sampling && self.broker.sampling_running() {
                        self.handle_stop_sampling().await;
                    }
                } else {
                    debug!("capture not running");
                    error = true;
                }
            }
            _ => {
                error!("capture startstop command unspecified");
                error = true;
            }
        }
        to_json(&StartStopReply {
            status: Status {
                error,
                ..Status::default()
            },
        })
    }

    fn metadata_template(&self) -> String {
        let mut meta = self.module.metadata();
        let topics: Vec<String> = self
            .resolved_schemas()
            .iter()
            .map(|s| {
                if s.topic().is_empty() {
                    self.module_name.clone()
                } else {
                    s.topic().to_string()
                }
            })
            .collect();
        meta.insert("_mcap_topics".to_string(), json!(topics));
        meta.insert("config".to_string(), json!(self.module.get_config()));
        Value::Object(meta).to_string()
    }
}

#[async_trait]
impl BusQueryable for HostInner {
    async fn notify_queryable(&self, topic: &str, payload: &str) -> String {
        match topic {
            "ping" => "pong".to_string(),
            "config" => self.handle_config(payload).await,
            "config_event" => {
                let event: ModuleConfigEvent =
                    serde_json::from_str(payload).unwrap_or(ModuleConfigEvent {
                        cmd: databeam_core::messages::ConfigEventCmd::Unspecified,
                        cfg_key: String::new(),
                    });
                debug!(cfg_key = %event.cfg_key, "config event");
                self.module.config_event(&event.cfg_key).await;
                to_json(&ModuleConfigEventReply { status: Status::ok() })
            }
            "data_config" => self.handle_data_config(payload).await,
            "sampling" => {
                let cmd = serde_json::from_str::<StartStop>(payload)
                    .map(|s| s.cmd)
                    .unwrap_or(StartStopCmd::Unspecified);
                let error = match cmd {
                    StartStopCmd::Start => !self.handle_start_sampling().await,
                    StartStopCmd::Stop => !self.handle_stop_sampling().await,
                    StartStopCmd::Unspecified => {
                        error!("sampling startstop command unspecified");
                        true
                    }
                };
                to_json(&StartStopReply {
                    status: Status {
                        error,
                        ..Status::default()
                    },
                })
            }
            "prepare_sampling" => {
                let cmd = serde_json::from_str::<StartStop>(payload)
                    .map(|s| s.cmd)
                    .unwrap_or(StartStopCmd::Unspecified);
                match cmd {
                    StartStopCmd::Start => {
                        if !self.broker.sampling_running() {
                            self.module.prepare_start_sampling().await;
                            debug!("sampling prepared");
                        } else {
                            warn!("prepare_sampling: sampling already running");
                        }
                    }
                    StartStopCmd::Stop => debug!("prepare_sampling stop ignored"),
                    StartStopCmd::Unspecified => {
                        error!("sampling startstop command unspecified")
                    }
                }
                to_json(&StartStopReply {
                    status: Status::ok(),
                })
            }
            "stop_sampling" => {
                let cmd = serde_json::from_str::<StartStop>(payload)
                    .map(|s| s.cmd)
                    .unwrap_or(StartStopCmd::Unspecified);
                let error = match cmd {
                    StartStopCmd::Stop => !self.handle_stop_sampling().await,
                    _ => {
                        error!("sampling startstop command unspecified");
                        true
                    }
                };
                to_json(&StartStopReply {
                    status: Status {
                        error,
                        ..Status::default()
                    },
                })
            }
            "prepare_capture" => self.handle_prepare_capture(payload).await,
            "stop_capture" => self.handle_stop_capture(payload).await,
            "get_latest" => self.broker.latest_data(),
            "get_schemas" => {
                let topic_names = self
                    .resolved_schemas()
                    .iter()
                    .map(|s| {
                        if s.topic().is_empty() {
                            self.module_name.clone()
                        } else {
                            s.topic().to_string()
                        }
                    })
                    .collect();
                to_json(&GetSchemasReply { topic_names })
            }
            "get_metadata" => self.metadata_template(),
            "get_docu" => {
                debug!("documentation requested");
                to_json(&DocumentationReply {
                    html_text: self.documentation.clone(),
                })
            }
            other => {
                error!(topic = other, "unknown query topic");
                "Received unknown query.".to_string()
            }
        }
    }
}

#[async_trait]
impl BusSubscriber for HostInner {
    async fn notify_subscriber(&self, key: &str, payload: &str) {
        let action = key.split('/').nth(3).unwrap_or("");
        match action {
            "start_capture" => {
                let cmd = serde_json::from_str::<StartStop>(payload)
                    .map(|s| s.cmd)
                    .unwrap_or(StartStopCmd::Unspecified);
                if cmd != StartStopCmd::Start {
                    error!("capture startstop command unspecified");
                    return;
                }
                if self.broker.capture_running() {
                    debug!("capture already running");
                    return;
                }
                if self.broker.start_capture() {
                    self.module.start_capture().await;
                    debug!("capture started");
                }
                if !self.broker.sampling_running() {
                    self.broker.start_sampling();
                    self.module.start_sampling().await;
                    debug!("sampling started for capture");
                }
            }
            "start_sampling" => {
                let cmd = serde_json::from_str::<StartStop>(payload)
                    .map(|s| s.cmd)
                    .unwrap_or(StartStopCmd::Unspecified);
                if cmd == StartStopCmd::Start {
                    self.handle_start_sampling().await;
                } else {
                    error!("sampling startstop command unspecified");
                }
            }
            "event_in" => self.module.event_in(payload).await,
            _ => error!(key, "unknown subscription key"),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        error!(error = %e, "reply serialization failed");
        "{}".to_string()
    })
}

// =========================================================================
// Config backups
// =========================================================================

fn backup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^config\.[0-9]{8}_[0-9]{6}\.json$").expect("static pattern")
    })
}

fn is_timestamped_config(file_name: &str) -> bool {
    backup_pattern().is_match(file_name)
}

/// Ensure the config directory exists; report whether the config file is
/// already present.
fn check_config_path(config_dir: &Path, config_file: &Path) -> bool {
    if !config_dir.is_dir() {
        if let Err(e) = fs::create_directory(config_dir) {
            error!(error = %e, "could not create config directory");
        }
        return false;
    }
    config_file.is_file()
}

/// True iff the pretty-printed form differs byte-for-byte from the stored
/// file.
fn has_config_changed(config_file: &Path, pretty: &str) -> bool {
    match fs::read_to_string_opt(config_file) {
        Ok(Some(stored)) => stored != pretty,
        _ => true,
    }
}

/// Write a timestamped snapshot next to `config.json` and prune the backup
/// trail to the newest `keep` files. Lexicographic order of the names is
/// chronological.
fn backup_config(config_dir: &Path, pretty: &str, keep: usize) -> anyhow::Result<()> {
    let backup_name = format!("config.{}.json", TimeSource::now_file_str());
    fs::write_string(&config_dir.join(&backup_name), pretty)?;

    let mut backups: Vec<PathBuf> = std::fs::read_dir(config_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(is_timestamped_config)
                .unwrap_or(false)
        })
        .collect();
    backups.sort();

    if backups.len() > keep {
        for old in &backups[..backups.len() - keep] {
            if let Err(e) = std::fs::remove_file(old) {
                warn!(path = %old.display(), error = %e, "could not delete old config backup");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockBus;
    use databeam_core::cfg::ConfigFactory;
    use parking_lot::Mutex;

    // ---------------------------------------------------------------
    // backup protocol
    // ---------------------------------------------------------------

    fn backup_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_timestamped_config(&e.file_name().to_string_lossy()))
            .count()
    }

    #[test]
    fn backup_pattern_matches_timestamped_names() {
        assert!(is_timestamped_config("config.20250114_093012.json"));
        assert!(!is_timestamped_config("config.json"));
        assert!(!is_timestamped_config("config.2025_bad.json"));
        assert!(!is_timestamped_config("xconfig.20250114_093012.json"));
    }

    #[test]
    fn backups_are_pruned_to_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            let name = format!("config.202501{:02}_000000.json", i + 1);
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        backup_config(dir.path(), "{}", 10).unwrap();
        assert_eq!(backup_count(dir.path()), 10);
        // the oldest were deleted
        assert!(!dir.path().join("config.20250101_000000.json").exists());
        assert!(dir.path().join("config.20250112_000000.json").exists());
    }

    #[test]
    fn unchanged_pretty_form_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, "{\n  \"a\": 1\n}").unwrap();
        assert!(!has_config_changed(&file, "{\n  \"a\": 1\n}"));
        assert!(has_config_changed(&file, "{\n  \"a\": 2\n}"));
        assert!(has_config_changed(&dir.path().join("missing.json"), "{}"));
    }

    // ---------------------------------------------------------------
    // host behavior against a mock bus
    // ---------------------------------------------------------------

    struct TestModule {
        name: String,
        config: Mutex<Value>,
        default_config: String,
    }

    impl TestModule {
        fn new() -> Arc<Self> {
            let mut cfg = ConfigFactory::new();
            cfg.number("gain", 1.0);
            let default_config = cfg.to_json_str();
            Arc::new(Self {
                name: "testmod".to_string(),
                config: Mutex::new(serde_json::from_str(&default_config).unwrap()),
                default_config,
            })
        }
    }

    #[async_trait]
    impl IoModule for TestModule {
        fn name(&self) -> &str {
            &self.name
        }
        fn module_type(&self) -> &str {
            "test"
        }
        async fn init(&self, _ctx: ModuleContext) {}
        fn default_config(&self) -> String {
            self.default_config.clone()
        }
        fn get_config(&self) -> String {
            self.config.lock().to_string()
        }
        fn validate_config(&self, cfg: &Value) -> Option<String> {
            if cfg.get("gain").and_then(Value::as_f64).is_none() {
                return Some("gain must be a number".to_string());
            }
            None
        }
        async fn apply_config(&self, cfg: &Value) {
            *self.config.lock() = cfg.clone();
        }
        fn schemas(&self) -> Vec<DataSchema> {
            let mut s = DataSchema::new();
            s.add_property("value", "number");
            vec![s]
        }
    }

    async fn host_in(dir: &Path) -> (ModuleHost, Arc<MockBus>) {
        let mut env = EnvConfig::new();
        env.set("MODULE_NAME", "testmod");
        env.set("DEPLOY_VERSION", "latest");
        env.set("DB_ID", "db");
        env.set("DATA_DIR", dir.join("data").to_str().unwrap());
        env.set("CONFIG_DIR", dir.join("config").to_str().unwrap());

        let bus = MockBus::new();
        let host = ModuleHost::new(
            TestModule::new(),
            &env,
            bus.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        host.inner.prepare_module().await.unwrap();
        (host, bus)
    }

    fn set_config_payload(cfg: &str) -> String {
        to_json(&ModuleConfigQuery {
            cmd: ModuleConfigCmd::Set,
            cfg_json: cfg.to_string(),
        })
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        assert_eq!(host.inner.notify_queryable("ping", "").await, "pong");
    }

    #[tokio::test]
    async fn accepted_set_writes_config_and_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let config_dir = host.inner.module_config_dir.clone();

        let reply = host
            .inner
            .notify_queryable("config", &set_config_payload(r#"{"gain": 2.0}"#))
            .await;
        let parsed: ModuleConfigReply = serde_json::from_str(&reply).unwrap();
        assert!(!parsed.status.error);
        assert!(config_dir.join("config.json").exists());
        assert_eq!(backup_count(&config_dir), 1);

        // identical content: no new file, no new backup
        let reply = host
            .inner
            .notify_queryable("config", &set_config_payload(r#"{"gain": 2.0}"#))
            .await;
        let parsed: ModuleConfigReply = serde_json::from_str(&reply).unwrap();
        assert!(!parsed.status.error);
        assert_eq!(backup_count(&config_dir), 1);
    }

    #[tokio::test]
    async fn rejected_set_reports_reason_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let config_dir = host.inner.module_config_dir.clone();

        let reply = host
            .inner
            .notify_queryable("config", &set_config_payload(r#"{"other": true}"#))
            .await;
        let parsed: ModuleConfigReply = serde_json::from_str(&reply).unwrap();
        assert!(parsed.status.error);
        assert_eq!(parsed.status.message, "gain must be a number");
        assert_eq!(backup_count(&config_dir), 0);
    }

    #[tokio::test]
    async fn get_returns_current_and_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;

        host.inner
            .notify_queryable("config", &set_config_payload(r#"{"gain": 3.5}"#))
            .await;
        let reply = host
            .inner
            .notify_queryable(
                "config",
                &to_json(&ModuleConfigQuery {
                    cmd: ModuleConfigCmd::Get,
                    cfg_json: String::new(),
                }),
            )
            .await;
        let parsed: ModuleConfigReply = serde_json::from_str(&reply).unwrap();
        let cfg: Value = serde_json::from_str(&parsed.cfg_json).unwrap();
        assert_eq!(cfg["gain"], 3.5);

        let reply = host
            .inner
            .notify_queryable(
                "config",
                &to_json(&ModuleConfigQuery {
                    cmd: ModuleConfigCmd::GetDefault,
                    cfg_json: String::new(),
                }),
            )
            .await;
        let parsed: ModuleConfigReply = serde_json::from_str(&reply).unwrap();
        let cfg: Value = serde_json::from_str(&parsed.cfg_json).unwrap();
        assert_eq!(cfg["gain"], 1.0);
    }

    #[tokio::test]
    async fn capture_stop_tears_sampling_down_when_it_started_it() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let inner = &host.inner;

        // idle -> prepare + broadcast start: sampling starts for capture
        inner
            .notify_queryable("prepare_capture", r#"{"name":"run1","run_id":1,"run_tag":""}"#)
            .await;
        inner
            .notify_subscriber("db/c/bc/start_capture", r#"{"cmd":1}"#)
            .await;
        assert!(inner.broker.capture_running());
        assert!(inner.broker.sampling_running());

        inner
            .notify_queryable("stop_capture", r#"{"cmd":2}"#)
            .await;
        assert!(!inner.broker.capture_running());
        assert!(!inner.broker.sampling_running());
        host.inner.broker.shutdown().await;
    }

    #[tokio::test]
    async fn capture_stop_leaves_preexisting_sampling_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let inner = &host.inner;

        inner
            .notify_subscriber("db/c/bc/start_sampling", r#"{"cmd":1}"#)
            .await;
        assert!(inner.broker.sampling_running());

        inner
            .notify_queryable("prepare_capture", r#"{"name":"run2","run_id":1,"run_tag":""}"#)
            .await;
        inner
            .notify_subscriber("db/c/bc/start_capture", r#"{"cmd":1}"#)
            .await;
        assert!(inner.broker.capture_running());

        inner
            .notify_queryable("stop_capture", r#"{"cmd":2}"#)
            .await;
        assert!(!inner.broker.capture_running());
        assert!(inner.broker.sampling_running());
        host.inner.broker.shutdown().await;
    }

    #[tokio::test]
    async fn stop_capture_when_idle_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let reply = host
            .inner
            .notify_queryable("stop_capture", r#"{"cmd":2}"#)
            .await;
        let parsed: StartStopReply = serde_json::from_str(&reply).unwrap();
        assert!(parsed.status.error);
    }

    #[tokio::test]
    async fn prepare_capture_writes_metadata_template() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let inner = &host.inner;

        inner
            .notify_queryable("prepare_capture", r#"{"name":"run3","run_id":1,"run_tag":""}"#)
            .await;
        let meta_file = inner
            .data_dir
            .join("run3")
            .join("testmod")
            .join("module_meta.json");
        let meta: Value =
            serde_json::from_str(&std::fs::read_to_string(meta_file).unwrap()).unwrap();
        assert_eq!(meta["_mcap_topics"], json!(["testmod"]));
        assert!(meta["config"].is_string());
        host.inner.broker.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_topic_yields_error_string() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let reply = host.inner.notify_queryable("nonsense", "").await;
        assert_eq!(reply, "Received unknown query.");
    }

    #[tokio::test]
    async fn get_schemas_resolves_default_topic() {
        let dir = tempfile::tempdir().unwrap();
        let (host, _bus) = host_in(dir.path()).await;
        let reply = host.inner.notify_queryable("get_schemas", "").await;
        let parsed: GetSchemasReply = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed.topic_names, vec!["testmod"]);
    }
}
