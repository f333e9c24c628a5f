//! Domain layer public interface.
//!
//! Broker-independent abstractions used by the pools and the RPC endpoints.
//! All domain consumers import symbols via this module, not by referencing
//! individual files directly.

mod broker;

pub use broker::{
    //
    Acker,
    ATTEMPT_HEADER,
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumeOptions,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryMode,
    DeliveryStream,
    Envelope,
    Headers,
    QueueOptions,
    STATUS_ERROR,
    STATUS_HEADER,
};
