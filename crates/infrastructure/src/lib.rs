pub mod channel_pool;
pub mod connector_factory;
pub mod in_memory_broker;
pub mod publisher;
pub mod rabbitmq;
pub mod reconnect;
pub mod topology;

pub use channel_pool::{ChannelPool, ChannelPoolStats, ChannelPurpose, PooledChannel};
pub use connector_factory::BrokerConnectorFactory;
pub use in_memory_broker::{InMemoryBroker, InMemoryConnector, StoredMessage};
pub use publisher::Publisher;
pub use rabbitmq::{RabbitMqChannel, RabbitMqConnection, RabbitMqConnector};
pub use reconnect::ReconnectPolicy;
pub use topology::TopologyManager;
