//! Per-module data broker.
//!
//! `data_in` is the hot path: it writes the record to the capture log and
//! fans it out to the two live streams, an unthrottled "all" queue and a
//! time-decimated "fixed" queue. One publisher task per queue performs the
//! actual bus publishes so the broker lock is never held across a network
//! call.

use databeam_bus::Bus;
use databeam_capture::{CaptureMessage, CaptureWriter};
use databeam_core::{DataConfigStore, DataSchema};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum QueueItem {
    Sample { schema_index: usize, payload: String },
    Shutdown,
}

#[derive(Default)]
struct BrokerState {
    sampling_running: bool,
    capture_running: bool,
    capture_prepared: bool,
    log_open: bool,
    writer: Option<CaptureWriter>,
    channel_ids: Vec<u16>,
    /// Timestamp of the last fixed-rate publish, per schema. Zero means
    /// "publish the next sample unconditionally".
    current_ts: Vec<u64>,
    frame_index: u32,
    latest_json: String,
    all_topics: Vec<String>,
    fixed_topics: Vec<String>,
    all_tx: Option<mpsc::UnboundedSender<QueueItem>>,
    fixed_tx: Option<mpsc::UnboundedSender<QueueItem>>,
}

pub struct DataBroker {
    bus: Arc<dyn Bus>,
    data_config: Arc<DataConfigStore>,
    db_id: String,
    module_name: String,
    state: Mutex<BrokerState>,
    publishers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DataBroker {
    pub fn new(
        bus: Arc<dyn Bus>,
        data_config: Arc<DataConfigStore>,
        db_id: &str,
        module_name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            data_config,
            db_id: db_id.to_string(),
            module_name: module_name.to_string(),
            state: Mutex::new(BrokerState::default()),
            publishers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Rebuild the per-schema live topics and restart the publisher tasks.
    /// Callers must quiesce sampling first.
    pub async fn set_schemas(&self, schemas: &[DataSchema]) {
        if self.sampling_running() {
            warn!("set_schemas while sampling is running");
        }
        self.stop_publishers().await;

        let mut all_topics = Vec::with_capacity(schemas.len());
        let mut fixed_topics = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let topic = if schema.topic().is_empty() {
                self.module_name.as_str()
            } else {
                schema.topic()
            };
            let base = format!("{}/m/{}/{}", self.db_id, self.module_name, topic);
            all_topics.push(format!("{base}/liveall"));
            fixed_topics.push(format!("{base}/livedec"));
        }

        let (all_tx, all_rx) = mpsc::unbounded_channel();
        let (fixed_tx, fixed_rx) = mpsc::unbounded_channel();
        {
            let mut st = self.state.lock();
            st.current_ts = vec![0; schemas.len()];
            st.all_topics = all_topics.clone();
            st.fixed_topics = fixed_topics.clone();
            st.all_tx = Some(all_tx);
            st.fixed_tx = Some(fixed_tx);
        }

        let mut publishers = self.publishers.lock().await;
        publishers.push(tokio::spawn(publisher(
            self.bus.clone(),
            all_topics,
            all_rx,
            "all",
        )));
        publishers.push(tokio::spawn(publisher(
            self.bus.clone(),
            fixed_topics,
            fixed_rx,
            "fixed",
        )));
    }

    /// Open the capture file and register one channel per schema. With
    /// capturing disabled in the data-config the broker still counts as
    /// prepared, it just skips the file work.
    pub fn prepare_capture(
        &self,
        module_name: &str,
        module_type: &str,
        measurement_dir: &Path,
        schemas: &[DataSchema],
    ) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        if st.capture_running {
            warn!("capture running on prepare_capture");
            anyhow::bail!("capture already running");
        }
        if st.log_open {
            warn!("capture file already open on prepare_capture");
            anyhow::bail!("capture file already open");
        }

        if !self.data_config.capture_enabled() {
            debug!("capturing disabled, prepared without file");
            st.channel_ids.clear();
            st.capture_prepared = true;
            return Ok(());
        }

        debug!("prepare capture file");
        let file_path = measurement_dir.join(format!("{module_name}.mcap"));
        let mut writer = CaptureWriter::create(&file_path)?;
        st.channel_ids.clear();
        for (index, schema) in schemas.iter().enumerate() {
            let dtype_name = if schema.dtype_name().is_empty() {
                format!("{module_type}_{index}")
            } else {
                schema.dtype_name().to_string()
            };
            let topic = if schema.topic().is_empty() {
                module_name
            } else {
                schema.topic()
            };
            let id = writer.add_schema(&dtype_name, topic, &schema.schema_string())?;
            st.channel_ids.push(id);
        }
        st.writer = Some(writer);
        st.log_open = true;
        st.capture_prepared = true;
        Ok(())
    }

    pub fn start_capture(&self) -> bool {
        let mut st = self.state.lock();
        if st.capture_running {
            warn!("capture running on start_capture");
            return false;
        }
        if !st.capture_prepared {
            warn!("start_capture refused: prepare was never called or failed");
            return false;
        }
        if self.data_config.capture_enabled() && !st.log_open {
            warn!("capture file not open on start_capture");
            return false;
        }
        st.capture_running = true;
        st.frame_index = 0;
        true
    }

    /// Idempotent: a second call logs and leaves the state unchanged.
    pub fn stop_capture(&self) {
        let mut st = self.state.lock();
        if !st.capture_running {
            debug!("capture not running on stop");
            return;
        }
        if let Some(writer) = st.writer.take() {
            if let Err(e) = writer.close() {
                error!(error = %e, "closing capture file failed");
            }
        }
        st.log_open = false;
        st.capture_running = false;
        st.capture_prepared = false;
    }

    pub fn start_sampling(&self) -> bool {
        let mut st = self.state.lock();
        if st.sampling_running {
            warn!("sampling already running");
            return false;
        }
        for ts in st.current_ts.iter_mut() {
            *ts = 0;
        }
        st.sampling_running = true;
        true
    }

    pub fn stop_sampling(&self) -> bool {
        let mut st = self.state.lock();
        if !st.sampling_running {
            warn!("sampling not running");
            return false;
        }
        st.sampling_running = false;
        true
    }

    pub fn sampling_running(&self) -> bool {
        self.state.lock().sampling_running
    }

    pub fn capture_running(&self) -> bool {
        self.state.lock().capture_running
    }

    /// Accept one sample. The payload must not contain a `ts` field; the
    /// broker injects it into the live and latest copies.
    pub fn data_in(
        &self,
        ts_ns: u64,
        payload: &Map<String, Value>,
        schema_index: usize,
        write_log: bool,
        write_live: bool,
        update_latest: bool,
    ) {
        let mut st = self.state.lock();
        if !st.sampling_running {
            return;
        }
        if schema_index >= st.current_ts.len() {
            error!(schema_index, "schema index out of range, record dropped");
            return;
        }

        let mut live_json: Option<String> = None;
        if update_latest {
            let mut with_ts = payload.clone();
            with_ts.insert("ts".to_string(), Value::from(ts_ns));
            let text = Value::Object(with_ts).to_string();
            st.latest_json = text.clone();
            if write_live {
                live_json = Some(text);
            }
        } else if write_live {
            let mut with_ts = payload.clone();
            with_ts.insert("ts".to_string(), Value::from(ts_ns));
            live_json = Some(Value::Object(with_ts).to_string());
        }

        if write_log && st.capture_running && st.log_open {
            if schema_index >= st.channel_ids.len() {
                error!(schema_index, "no capture channel for schema, record dropped");
                return;
            }
            let channel_id = st.channel_ids[schema_index];
            let sequence = st.frame_index;
            st.frame_index += 1;
            match serde_json::to_string(payload) {
                Ok(body) => {
                    if let Some(writer) = st.writer.as_mut() {
                        let result = writer.write_message(&CaptureMessage {
                            channel_id,
                            sequence,
                            log_time: ts_ns,
                            publish_time: ts_ns,
                            data: body.as_bytes(),
                        });
                        if let Err(e) = result {
                            error!(error = %e, "capture write failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "sample serialization failed"),
            }
        }

        if write_live {
            let Some(live) = live_json else { return };

            if self.data_config.all_enabled() {
                if let Some(tx) = &st.all_tx {
                    let _ = tx.send(QueueItem::Sample {
                        schema_index,
                        payload: live.clone(),
                    });
                }
            }

            if self.data_config.fixed_enabled() {
                let period_ns = (self.data_config.fixed_delta_time() * 1e9) as u64;
                let last = st.current_ts[schema_index];
                if last == 0 || ts_ns.saturating_sub(last) >= period_ns {
                    st.current_ts[schema_index] = ts_ns;
                    if let Some(tx) = &st.fixed_tx {
                        let _ = tx.send(QueueItem::Sample {
                            schema_index,
                            payload: live,
                        });
                    }
                }
            } else {
                st.current_ts[schema_index] = 0;
            }
        }
    }

    /// Last completed sample including its `ts` field, `{}` before the
    /// first one.
    pub fn latest_data(&self) -> String {
        let st = self.state.lock();
        if st.latest_json.is_empty() {
            "{}".to_string()
        } else {
            st.latest_json.clone()
        }
    }

    /// Stop everything, close a leftover capture file and drain the
    /// publisher tasks with a sentinel.
    pub async fn shutdown(&self) {
        debug!("data broker shutdown");
        {
            let mut st = self.state.lock();
            st.sampling_running = false;
            st.capture_running = false;
            st.capture_prepared = false;
            if let Some(writer) = st.writer.take() {
                if let Err(e) = writer.close() {
                    error!(error = %e, "closing capture file on shutdown failed");
                }
            }
            st.log_open = false;
        }
        self.stop_publishers().await;
        debug!("data broker shutdown done");
    }

    async fn stop_publishers(&self) {
        let (all_tx, fixed_tx) = {
            let mut st = self.state.lock();
            (st.all_tx.take(), st.fixed_tx.take())
        };
        if let Some(tx) = all_tx {
            let _ = tx.send(QueueItem::Shutdown);
        }
        if let Some(tx) = fixed_tx {
            let _ = tx.send(QueueItem::Shutdown);
        }
        let mut publishers = self.publishers.lock().await;
        for handle in publishers.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn publisher(
    bus: Arc<dyn Bus>,
    topics: Vec<String>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    label: &'static str,
) {
    debug!(label, "live publisher started");
    while let Some(item) = rx.recv().await {
        match item {
            QueueItem::Shutdown => break,
            QueueItem::Sample {
                schema_index,
                payload,
            } => match topics.get(schema_index) {
                Some(topic) => bus.publish(topic, &payload).await,
                None => debug!(schema_index, "no live topic for schema index"),
            },
        }
    }
    debug!(label, "live publisher shutdown");
}
