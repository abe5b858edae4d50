//! AMQP broker adapter.
//!
//! Both sides declare the same topology before use: a durable direct
//! exchange, a durable queue and a binding between them. Consumers ask for a
//! prefetch of one so a worker never holds more than the job it is running.

use std::time::Duration;

use amiquip::{
    AmqpProperties, Channel, Connection, ConsumerMessage, ConsumerOptions,
    ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
};
use anyhow::{Context, Result, bail};
use conveyor_config::QueueConfig;
use conveyor_retry::Retrier;
use conveyor_types::JobDescriptor;

use crate::consumer::{Delivery, JobSource, Received};
use crate::runner::Reporter;

/// Messages survive a broker restart.
const PERSISTENT: u8 = 2;

/// An open connection with one channel.
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    config: QueueConfig,
}

impl BrokerConnection {
    /// Connect, retrying per `config.connect_retry`.
    pub fn open(config: &QueueConfig, reporter: &mut dyn Reporter) -> Result<Self> {
        let url = config.amqp_url();
        let retrier = Retrier::new(config.connect_retry.clone());
        let mut connection = retrier
            .run_observed(
                |_| Connection::insecure_open(&url),
                |failed| {
                    if let Some(delay) = failed.next_delay {
                        reporter.warn(&format!(
                            "broker connection attempt {}/{} failed: {}; retrying in {}",
                            failed.attempt,
                            failed.max_attempts,
                            failed.error,
                            humantime::format_duration(delay)
                        ));
                    }
                },
            )
            .with_context(|| format!("failed to connect to {}", config.display_url()))?;
        reporter.info(&format!("connected to {}", config.display_url()));

        let channel = connection
            .open_channel(None)
            .context("failed to open AMQP channel")?;

        Ok(Self {
            connection,
            channel,
            config: config.clone(),
        })
    }

    fn declare(&self) -> Result<()> {
        let exchange = &self.config.new_job_exchange;
        let queue = &self.config.new_job_queue;

        self.channel
            .exchange_declare(
                ExchangeType::Direct,
                exchange.as_str(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .with_context(|| format!("failed to declare exchange {exchange}"))?;
        self.channel
            .queue_declare(
                queue.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .with_context(|| format!("failed to declare queue {queue}"))?;
        self.channel
            .queue_bind(
                queue.as_str(),
                exchange.as_str(),
                self.config.routing_key.as_str(),
                FieldTable::default(),
            )
            .with_context(|| format!("failed to bind queue {queue} to {exchange}"))?;
        Ok(())
    }

    /// Start consuming the job queue with manual acknowledgement.
    pub fn consume(&self) -> Result<AmqpJobSource<'_>> {
        self.channel
            .qos(0, 1, false)
            .context("failed to set prefetch count")?;
        self.declare()?;
        let consumer = self
            .channel
            .basic_consume(self.config.new_job_queue.as_str(), ConsumerOptions::default())
            .with_context(|| format!("failed to consume {}", self.config.new_job_queue))?;
        Ok(AmqpJobSource { consumer })
    }

    /// Publish a job description as a persistent message.
    pub fn publish(&self, job: &JobDescriptor) -> Result<()> {
        self.declare()?;
        let body = job.to_json()?;
        self.channel
            .basic_publish(
                self.config.new_job_exchange.as_str(),
                Publish::with_properties(
                    body.as_bytes(),
                    self.config.routing_key.as_str(),
                    AmqpProperties::default().with_delivery_mode(PERSISTENT),
                ),
            )
            .with_context(|| format!("failed to publish job {}", job.id()))?;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.connection
            .close()
            .context("failed to close broker connection")
    }
}

/// A delivery from the broker.
pub struct AmqpDelivery(amiquip::Delivery);

impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.body
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }
}

/// Anything but a delivery means the consumer is gone. That is an error, so
/// the worker exits non-zero and its supervisor restarts it.
fn received(message: ConsumerMessage) -> Result<Received<AmqpDelivery>> {
    match message {
        ConsumerMessage::Delivery(delivery) => Ok(Received::Delivery(AmqpDelivery(delivery))),
        ConsumerMessage::ServerClosedChannel(err) | ConsumerMessage::ServerClosedConnection(err) => {
            Err(anyhow::Error::new(err).context("broker closed the connection"))
        }
        ConsumerMessage::ServerCancelled => bail!("broker cancelled the consumer"),
        ConsumerMessage::ClientCancelled => bail!("consumer was cancelled"),
        ConsumerMessage::ClientClosedChannel | ConsumerMessage::ClientClosedConnection => {
            bail!("broker channel was closed")
        }
    }
}

/// Job queue consumer bound to a [`BrokerConnection`]'s channel.
pub struct AmqpJobSource<'a> {
    consumer: amiquip::Consumer<'a>,
}

impl JobSource for AmqpJobSource<'_> {
    type Delivery = AmqpDelivery;

    fn next_delivery(&mut self, timeout: Duration) -> Result<Received<AmqpDelivery>> {
        match self.consumer.receiver().recv_timeout(timeout) {
            Ok(message) => received(message),
            Err(e) if e.is_timeout() => Ok(Received::Idle),
            Err(_) => bail!("lost the broker connection"),
        }
    }

    fn ack(&mut self, delivery: AmqpDelivery) -> Result<()> {
        self.consumer
            .ack(delivery.0)
            .context("failed to acknowledge delivery")
    }

    fn nack(&mut self, delivery: AmqpDelivery, requeue: bool) -> Result<()> {
        self.consumer
            .nack(delivery.0, requeue)
            .context("failed to reject delivery")
    }
}
