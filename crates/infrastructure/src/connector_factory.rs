use std::sync::Arc;

use tracing::{debug, info};

use courier_config::{BrokerType, MessageQueueConfig};
use courier_core::BrokerConnector;

use crate::{InMemoryBroker, RabbitMqConnector};

pub struct BrokerConnectorFactory;

impl BrokerConnectorFactory {
    /// 按配置选择 broker 实现；内存 broker 每次调用都是一个全新实例
    pub fn create(config: &MessageQueueConfig) -> Arc<dyn BrokerConnector> {
        debug!("Creating broker connector with type: {:?}", config.broker);

        match config.broker {
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ connector");
                Arc::new(RabbitMqConnector)
            }
            BrokerType::InMemory => {
                info!("Initializing in-memory broker");
                Arc::new(InMemoryBroker::new().connector())
            }
        }
    }
}
