//! The filter module: glue between the upstream subscription, the filter
//! arithmetic and the data broker.
//!
//! The sample path acquires the filter lock non-blocking: a config apply
//! preempts it, and samples arriving mid-reconfiguration are dropped
//! rather than waited for.

use crate::filters::{Filter, FilterMethod, Timebase};
use async_trait::async_trait;
use databeam_bus::BusSubscriber;
use databeam_core::cfg::ConfigFactory;
use databeam_core::{DataSchema, EnvConfig};
use databeam_runtime::{IoModule, ModuleContext};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info};

struct FilterState {
    filter: Option<Filter>,
    subscribed_topic: String,
}

pub struct FilterModule {
    weak: Weak<FilterModule>,
    name: String,
    db_id: String,
    default_config: String,
    config: Mutex<Value>,
    state: Mutex<FilterState>,
    ctx: OnceLock<ModuleContext>,
}

impl FilterModule {
    pub fn new(env: &EnvConfig) -> Arc<Self> {
        let mut cfg = ConfigFactory::new();
        cfg.string("input_module", "module/topic");
        cfg.string_array("channels", ["channel"]).resizeable();
        cfg.string("timebase", "samples").select(["samples", "time"]);
        cfg.number("timebase_value", 10.0);
        cfg.string("method", "average").select(FilterMethod::NAMES);
        let default_config = cfg.to_json_str();
        let config = cfg.to_json();

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            name: env.get("MODULE_NAME"),
            db_id: env.get("DB_ID"),
            default_config,
            config: Mutex::new(config),
            state: Mutex::new(FilterState {
                filter: None,
                subscribed_topic: String::new(),
            }),
            ctx: OnceLock::new(),
        })
    }

    fn subscriber(&self) -> Option<Arc<dyn BusSubscriber>> {
        self.weak
            .upgrade()
            .map(|module| module as Arc<dyn BusSubscriber>)
    }

    fn configured_channels(&self) -> Vec<String> {
        self.config
            .lock()
            .get("channels")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl IoModule for FilterModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn module_type(&self) -> &str {
        "filter"
    }

    async fn init(&self, ctx: ModuleContext) {
        let _ = self.ctx.set(ctx);
    }

    fn default_config(&self) -> String {
        self.default_config.clone()
    }

    fn get_config(&self) -> String {
        self.config.lock().to_string()
    }

    fn validate_config(&self, cfg: &Value) -> Option<String> {
        let input = cfg.get("input_module").and_then(Value::as_str).unwrap_or("");
        if input.is_empty() {
            return Some("input_module must not be empty".to_string());
        }
        let Some(channels) = cfg.get("channels").and_then(Value::as_array) else {
            return Some("channels must be an array of strings".to_string());
        };
        if channels.is_empty()
            || channels
                .iter()
                .any(|c| c.as_str().map(str::is_empty).unwrap_or(true))
        {
            return Some("channels must be non-empty strings".to_string());
        }
        match cfg.get("timebase").and_then(Value::as_str) {
            Some("samples") | Some("time") => {}
            _ => return Some("timebase must be \"samples\" or \"time\"".to_string()),
        }
        match cfg.get("timebase_value").and_then(Value::as_f64) {
            Some(v) if v > 0.0 => {}
            _ => return Some("timebase_value must be a positive number".to_string()),
        }
        let method = cfg.get("method").and_then(Value::as_str).unwrap_or("");
        if FilterMethod::parse(method).is_none() {
            return Some(format!("invalid filter method <{method}>"));
        }
        None
    }

    async fn apply_config(&self, cfg: &Value) {
        let Some(ctx) = self.ctx.get() else {
            error!("apply_config before init");
            return;
        };

        // drop the old filter first so the sample path goes idle, then
        // detach from the old upstream topic
        let old_topic = {
            let mut st = self.state.lock();
            st.filter = None;
            std::mem::take(&mut st.subscribed_topic)
        };
        if !old_topic.is_empty() {
            if let Some(subscriber) = self.subscriber() {
                info!(topic = %old_topic, "unsubscribing from upstream");
                ctx.bus.unsubscribe(&old_topic, subscriber).await;
            }
        }

        *self.config.lock() = cfg.clone();

        let Some(method) = cfg
            .get("method")
            .and_then(Value::as_str)
            .and_then(FilterMethod::parse)
        else {
            error!("invalid filter method in applied config");
            return;
        };
        let timebase = match cfg.get("timebase").and_then(Value::as_str) {
            Some("time") => Timebase::Time,
            _ => Timebase::Samples,
        };
        let timebase_value = cfg
            .get("timebase_value")
            .and_then(Value::as_f64)
            .unwrap_or(10.0);
        let channels = self.configured_channels();
        let input_module = cfg
            .get("input_module")
            .and_then(Value::as_str)
            .unwrap_or("");

        info!(?method, ?timebase, timebase_value, "installing filter");
        let topic = format!("{}/m/{}", self.db_id, input_module);
        {
            let mut st = self.state.lock();
            st.filter = Some(Filter::new(method, timebase, timebase_value, channels));
            st.subscribed_topic = topic.clone();
        }
        if let Some(subscriber) = self.subscriber() {
            info!(topic = %topic, "subscribing to upstream");
            ctx.bus.subscribe(&topic, subscriber).await;
        }
    }

    fn schemas(&self) -> Vec<DataSchema> {
        let mut schema = DataSchema::new();
        schema.set_topic(&self.name);
        for channel in self.configured_channels() {
            schema.add_property(&format!("{channel}_filtered"), "number");
        }
        vec![schema]
    }

    async fn start_sampling(&self) -> bool {
        if let Some(filter) = self.state.lock().filter.as_mut() {
            filter.clear_data();
        }
        true
    }
}

#[async_trait]
impl BusSubscriber for FilterModule {
    async fn notify_subscriber(&self, key: &str, payload: &str) {
        // A config apply owns the lock while it swaps filters; samples
        // racing it carry stale data and are dropped.
        let Some(mut st) = self.state.try_lock() else {
            return;
        };
        if st.subscribed_topic != key {
            return;
        }
        let Some(filter) = st.filter.as_mut() else {
            return;
        };
        let Some(ctx) = self.ctx.get() else {
            return;
        };

        let Ok(body) = serde_json::from_str::<Value>(payload) else {
            debug!("unparsable upstream sample dropped");
            return;
        };
        let Some(object) = body.as_object() else {
            return;
        };
        let Some(ts_ns) = object.get("ts").and_then(Value::as_u64) else {
            debug!("upstream sample without ts dropped");
            return;
        };

        let sampling = ctx.broker.sampling_running();
        let mut out = Map::new();
        let channels: Vec<String> = filter.channels().to_vec();
        for channel in channels {
            let Some(value) = object.get(&channel).and_then(Value::as_f64) else {
                continue;
            };
            filter.update(ts_ns, value, &channel);
            if sampling {
                out.insert(
                    format!("{channel}_filtered"),
                    json!(filter.compute(&channel)),
                );
            }
        }

        if !filter.ready_to_publish() {
            return;
        }
        filter.after_publish();
        ctx.broker.data_in(ts_ns, &out, 0, true, true, true);
    }
}
