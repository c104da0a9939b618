//! MQ Consumer Adapter (§4.8, optional)
//!
//! Two durable routes into the same `TaskManager`: a "completed"-tagged
//! route and a catch-all route, distinguished by a `tabs` list carried on
//! every message body. One background task is spawned per message; the
//! Session Pool slot for that task is acquired inside `TaskManager::submit`
//! (via the scheduler routine it spawns), never at consume time, so a
//! message that fails decode or queue-tag validation never touches the
//! pool at all.

use std::sync::Arc;

use engine_core::manager::TaskManager;
use engine_core::session_pool::BrowserBackend;
use engine_shared::config::{DeliveryMode, MqConfig};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions, ExchangeDeclareOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{info, warn};

const COMPLETED_TAG: &str = "completed";

/// Which of the two durable routes a consumer loop is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Completed,
    Other,
}

/// Validates the queue-tag rule at decode time (§4.8): the completed route
/// only accepts an absent `tabs` (injecting `["completed"]`) or an exact
/// match; the other route rejects anything tagged `["completed"]`.
pub fn enforce_queue_tag(route: Route, body: &mut serde_json::Value) -> Result<(), String> {
    let Some(obj) = body.as_object_mut() else {
        return Err("message body must be a JSON object".to_string());
    };

    let tabs: Option<Vec<String>> = match obj.get("tabs") {
        Some(serde_json::Value::Array(items)) => {
            Some(items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        }
        Some(_) => return Err("tabs must be an array of strings".to_string()),
        None => None,
    };

    match route {
        Route::Completed => match tabs {
            None => {
                obj.insert("tabs".to_string(), serde_json::json!([COMPLETED_TAG]));
                Ok(())
            }
            Some(tags) if tags == [COMPLETED_TAG] => Ok(()),
            Some(_) => Err("completed route requires tabs == [\"completed\"]".to_string()),
        },
        Route::Other => match tabs {
            Some(tags) if tags == [COMPLETED_TAG] => Err("other route rejects tabs == [\"completed\"]".to_string()),
            _ => Ok(()),
        },
    }
}

/// Tracks the task id most recently submitted by this adapter instance, so
/// an operator's `cancel_current_task` hook has something to act on without
/// needing the caller to already know the generated id.
#[derive(Default)]
pub struct CurrentTask {
    task_id: Mutex<Option<String>>,
}

impl CurrentTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn set(&self, task_id: String) {
        *self.task_id.lock().await = Some(task_id);
    }

    /// Signals ForceCancel on whichever task this adapter last submitted.
    /// A no-op if nothing has been submitted yet.
    pub async fn cancel_current_task<B: BrowserBackend + 'static>(&self, manager: &TaskManager<B>) {
        if let Some(task_id) = self.task_id.lock().await.clone() {
            match manager.force_cancel(&task_id).await {
                Ok(true) => info!(task_id, "cancelled current task via consumer hook"),
                Ok(false) => info!(task_id, "current task already terminal, nothing to cancel"),
                Err(err) => warn!(task_id, %err, "failed to cancel current task"),
            }
        }
    }
}

pub struct ConsumerAdapter<B: BrowserBackend + 'static> {
    channel: Channel,
    config: MqConfig,
    manager: Arc<TaskManager<B>>,
    current_task: Arc<CurrentTask>,
}

impl<B: BrowserBackend + 'static> ConsumerAdapter<B> {
    pub async fn connect(config: MqConfig, manager: Arc<TaskManager<B>>) -> anyhow::Result<Self> {
        let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &config.dead_letter_exchange,
                lapin::ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(&config.completed_queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        channel
            .queue_declare(&config.other_queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;

        Ok(Self { channel, config, manager, current_task: CurrentTask::new() })
    }

    pub fn current_task(&self) -> Arc<CurrentTask> {
        Arc::clone(&self.current_task)
    }

    /// Runs both consumer loops concurrently until the process shuts down.
    pub async fn run(self) -> anyhow::Result<()> {
        let completed = self.run_route(Route::Completed, self.config.completed_queue.clone());
        let other = self.run_route(Route::Other, self.config.other_queue.clone());
        tokio::try_join!(completed, other)?;
        Ok(())
    }

    async fn run_route(&self, route: Route, queue_name: String) -> anyhow::Result<()> {
        let auto_ack = matches!(self.config.delivery_mode, DeliveryMode::AtMostOnce);
        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                "engine-server",
                BasicConsumeOptions { no_ack: auto_ack, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            let data = delivery.data.clone();

            let outcome = self.handle_one(route, &data).await;

            match (self.config.delivery_mode, outcome) {
                (DeliveryMode::AtLeastOnce, Ok(())) => {
                    delivery.ack(BasicAckOptions::default()).await?;
                }
                (DeliveryMode::AtLeastOnce, Err(reason)) => {
                    warn!(%reason, "rejecting message without requeue");
                    delivery.reject(BasicRejectOptions { requeue: false }).await?;
                }
                (DeliveryMode::AtMostOnce, Err(reason)) => {
                    warn!(%reason, "publishing failed message to dead-letter exchange");
                    let mut headers = FieldTable::default();
                    headers.insert("x-error".into(), lapin::types::AMQPValue::LongString(reason.into()));
                    self.channel
                        .basic_publish(
                            &self.config.dead_letter_exchange,
                            "",
                            BasicPublishOptions::default(),
                            &data,
                            BasicProperties::default().with_headers(headers),
                        )
                        .await?;
                }
                (DeliveryMode::AtMostOnce, Ok(())) => {}
            }
        }
        Ok(())
    }

    /// Decodes, enforces the queue tag, and submits one message. The
    /// Session Pool slot is acquired later, inside the scheduler routine
    /// `submit` spawns — never here.
    async fn handle_one(&self, route: Route, data: &[u8]) -> Result<(), String> {
        let mut body: serde_json::Value = serde_json::from_slice(data).map_err(|e| format!("parse error: {e}"))?;
        enforce_queue_tag(route, &mut body)?;

        let payload: engine_shared::TaskPayload =
            serde_json::from_value(body).map_err(|e| format!("invalid task payload: {e}"))?;

        let task_id = self.manager.submit(payload, "mq-consumer").await.map_err(|e| e.to_string())?;
        self.current_task.set(task_id.clone()).await;
        info!(task_id, ?route, "submitted task from MQ message");
        Ok(())
    }
}
