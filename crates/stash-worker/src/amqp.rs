//! AMQP 0-9-1 broker adapter.
//!
//! Transaction queues are drained with `basic.get` on a shared channel. The
//! commit queue is consumed on its own channel so a channel-level error on one
//! side never takes the other down.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use serde_json::{Map, Number, Value};
use stash_kernel::broker::{Acknowledge, Broker, BrokerError, Delivery, Headers, QueueDeletion};
use std::sync::Arc;
use tracing::{info, warn};

/// Commit signals are handled one by one per consumer, but drains run in the
/// background, so a small prefetch keeps several transactions moving.
const COMMIT_PREFETCH: u16 = 16;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    /// Channel used for transaction queue pulls and their acknowledgements.
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to AMQP broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;
        info!("connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declares the commit queue and starts a manual-ack consumer on it.
    pub async fn consume_commits(&self, queue: &str) -> Result<Consumer> {
        let channel = self
            .connection
            .create_channel()
            .await
            .context("failed to open commit channel")?;
        declare(&channel, queue)
            .await
            .with_context(|| format!("failed to declare commit queue '{queue}'"))?;
        channel
            .basic_qos(COMMIT_PREFETCH, BasicQosOptions::default())
            .await
            .context("failed to set commit prefetch")?;
        let consumer = channel
            .basic_consume(
                queue,
                "stash-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to consume '{queue}'"))?;
        info!(queue, "consuming transaction signals");
        Ok(consumer)
    }

    async fn delete_if_empty_on(
        &self,
        scratch: &Channel,
        queue: &str,
    ) -> Result<QueueDeletion, BrokerError> {
        let state = scratch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError::queue("inspect", queue, err))?;
        let messages = state.message_count();
        if messages > 0 {
            return Ok(QueueDeletion::NotEmpty { messages });
        }

        match scratch
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_empty: true,
                    ..QueueDeleteOptions::default()
                },
            )
            .await
        {
            Ok(_) => Ok(QueueDeletion::Deleted),
            Err(err) if is_precondition_failed(&err) => {
                warn!(queue, error = %err, "queue filled between inspection and delete");
                Ok(QueueDeletion::NotEmpty { messages: 0 })
            }
            Err(err) => Err(BrokerError::queue("delete", queue, err)),
        }
    }
}

/// The broker's answer to an `if-empty` delete of a queue that has messages.
fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

async fn declare(channel: &Channel, queue: &str) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        declare(&self.channel, queue)
            .await
            .map_err(|err| BrokerError::queue("declare", queue, err))
    }

    async fn publish(
        &self,
        queue: &str,
        kind: &str,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_kind(ShortString::from(kind))
            .with_headers(json_to_field_table(&headers))
            .with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::queue("publish", queue, err))
    }

    async fn pull(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|err| BrokerError::queue("get", queue, err))?;
        Ok(message.map(|message| into_delivery(message.delivery)))
    }

    async fn delete_queue_if_empty(&self, queue: &str) -> Result<QueueDeletion, BrokerError> {
        // A failed passive declare or a refused delete closes the channel it
        // ran on, so both go through a throwaway channel.
        let scratch = self
            .connection
            .create_channel()
            .await
            .map_err(|err| BrokerError::Connection(err.to_string()))?;

        let outcome = self.delete_if_empty_on(&scratch, queue).await;

        if scratch.status().connected() {
            if let Err(err) = scratch.close(200, "done").await {
                warn!(queue, error = %err, "failed to close scratch channel");
            }
        }
        outcome
    }
}

/// Settles one message on the channel it was delivered on.
struct LapinAck {
    acker: Acker,
}

#[async_trait]
impl Acknowledge for LapinAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| BrokerError::Acknowledge(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| BrokerError::Acknowledge(err.to_string()))
    }
}

pub fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    let AmqpDelivery {
        properties,
        data,
        acker,
        ..
    } = delivery;
    Delivery::new(
        message_kind(&properties),
        headers_of(&properties),
        data,
        Arc::new(LapinAck { acker }),
    )
}

fn message_kind(properties: &BasicProperties) -> Option<String> {
    properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_string())
}

fn headers_of(properties: &BasicProperties) -> Headers {
    properties
        .headers()
        .as_ref()
        .map(field_table_to_json)
        .unwrap_or_default()
}

pub fn field_table_to_json(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_to_json(value)))
        .collect()
}

/// Header values become JSON. Byte strings are read as UTF-8 (lossy), which is
/// how AMQP clients publish plain string headers.
pub fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Timestamp(n) => Value::from(*n),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::DecimalValue(d) => {
            let scaled = f64::from(d.value) / 10f64.powi(i32::from(d.scale));
            Number::from_f64(scaled).map(Value::Number).unwrap_or(Value::Null)
        }
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ByteArray(bytes) => {
            Value::String(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(amqp_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(field_table_to_json(table)),
        AMQPValue::Void => Value::Null,
    }
}

pub fn json_to_field_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.as_str()), json_to_amqp(value));
    }
    table
}

/// Inverse of [`amqp_to_json`]: strings go out as long strings, integers as
/// signed 64-bit values.
pub fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(json_to_amqp).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(json_to_field_table(map)),
    }
}

#[cfg(test)]
mod tests {
    use lapin::protocol::AMQPError;
    use serde_json::json;

    use super::*;

    fn channel_error(kind: AMQPSoftError, message: &str) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(kind),
            ShortString::from(message),
        ))
    }

    #[test]
    fn only_precondition_failures_mean_the_queue_refilled() {
        assert!(is_precondition_failed(&channel_error(
            AMQPSoftError::PRECONDITIONFAILED,
            "PRECONDITION_FAILED - queue 'txn-1' in vhost '/' not empty",
        )));
        assert!(!is_precondition_failed(&channel_error(
            AMQPSoftError::NOTFOUND,
            "NOT_FOUND - no queue 'txn-1' in vhost '/'",
        )));
        assert!(!is_precondition_failed(&channel_error(
            AMQPSoftError::ACCESSREFUSED,
            "ACCESS_REFUSED - access to queue 'txn-1' refused",
        )));
    }

    #[test]
    fn staged_operation_headers_convert_to_json() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("S3Prefix"),
            AMQPValue::LongString(LongString::from("u-1")),
        );
        table.insert(ShortString::from("size"), AMQPValue::LongLongInt(42));
        table.insert(ShortString::from("authenticated"), AMQPValue::Boolean(true));
        table.insert(ShortString::from("userID"), AMQPValue::LongInt(7));
        table.insert(ShortString::from("ACL"), AMQPValue::Void);

        assert_eq!(
            Value::Object(field_table_to_json(&table)),
            json!({
                "S3Prefix": "u-1",
                "size": 42,
                "authenticated": true,
                "userID": 7,
                "ACL": null,
            })
        );
    }

    #[test]
    fn nested_values_convert() {
        let mut inner = FieldTable::default();
        inner.insert(ShortString::from("k"), AMQPValue::ShortString("v".into()));
        let array = FieldArray::from(vec![AMQPValue::LongUInt(1), AMQPValue::FieldTable(inner)]);
        assert_eq!(
            amqp_to_json(&AMQPValue::FieldArray(array)),
            json!([1, { "k": "v" }])
        );
        assert_eq!(amqp_to_json(&AMQPValue::Double(f64::NAN)), Value::Null);
    }

    #[test]
    fn published_headers_read_back_unchanged() {
        let headers = json!({
            "S3Prefix": "u-1",
            "name": "cat.png",
            "size": 3,
            "authenticated": false,
            "ACL": null,
            "tags": ["a", 2.5],
        });
        let Value::Object(map) = headers.clone() else {
            unreachable!()
        };
        assert_eq!(Value::Object(field_table_to_json(&json_to_field_table(&map))), headers);
    }

    #[test]
    fn properties_supply_kind_and_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from("txn-9")),
        );
        let properties = BasicProperties::default()
            .with_kind(ShortString::from("commit"))
            .with_headers(table);

        assert_eq!(message_kind(&properties).as_deref(), Some("commit"));
        assert_eq!(headers_of(&properties).get("queue"), Some(&json!("txn-9")));
        assert!(headers_of(&BasicProperties::default()).is_empty());
    }
}
