use anyhow::Result;

/// Demo-only environment wiring: reads broker connection details and the
/// topic prefix from the environment, falling back to sane local defaults.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub kafka_bootstrap_servers: String,
    pub kafka_group_id: String,
    pub topic_prefix: String,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            kafka_bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            kafka_group_id: std::env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| format!("TASK_QUEUE_GROUP_{}", std::process::id())),
            topic_prefix: std::env::var("TASK_QUEUE_TOPIC_PREFIX")
                .unwrap_or_else(|_| "TASK_QUEUE".to_string()),
        })
    }
}
