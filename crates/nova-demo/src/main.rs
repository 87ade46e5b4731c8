mod config;

use anyhow::Result;
use async_trait::async_trait;
use config::DemoConfig;
use nova_queue::{
    BrokerKind, Priority, QueueConfig, Task, TaskEnvelope, TaskHandler, TaskQueue,
};
use nova_queue::config::KafkaBrokerConfig;
use std::sync::Arc;
use tracing::{error, info};

struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: TaskEnvelope) -> nova_queue::Result<()> {
        info!(task_id = %task.task_id, task_type = %task.task.task_type, "processed task");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("nova_demo=info,nova_queue=info,rdkafka=info")
        .init();

    let demo_config = DemoConfig::from_env()?;

    let kafka_config = KafkaBrokerConfig::new(
        demo_config.kafka_bootstrap_servers.as_str(),
        demo_config.kafka_group_id.as_str(),
    );
    let queue_config = QueueConfig::builder(BrokerKind::Kafka(kafka_config))
        .topic_prefix(demo_config.topic_prefix.as_str())
        .build();

    let queue = TaskQueue::new(queue_config).await?;
    queue.start(Arc::new(LoggingHandler)).await?;

    queue
        .enqueue(
            Task::new("send_email", b"hello from nova-demo".to_vec()),
            nova_queue::EnqueueOptions::default().with_priority(Priority::High),
        )
        .await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::select! {
        _ = ctrl_c => {
            info!("received ctrl-c, shutting down gracefully");
        }
    }

    if let Err(e) = queue.stop().await {
        error!(error = %e, "error during task queue shutdown");
    } else {
        info!("task queue stopped cleanly");
    }

    Ok(())
}
