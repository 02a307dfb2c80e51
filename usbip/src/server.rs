//! Server coordinator: composes device discovery, the request processor, and
//! the TCP server, and wires device events into the device monitor.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::discovery::Discovery;
use crate::monitor::{DeviceEvent, DeviceMonitor};
use crate::net::{ClientConnection, TcpServer};
use crate::request::RequestProcessor;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to initialize server: {0}")]
    InitializationFailed(String),
}

pub struct ServerCoordinator<D: Discovery + 'static> {
    discovery: Arc<D>,
    monitor: Arc<DeviceMonitor<D>>,
    processor: Arc<RequestProcessor<D>>,
    tcp: Arc<TcpServer>,
    port: u16,
}

impl<D: Discovery + 'static> ServerCoordinator<D> {
    pub fn new(
        discovery: Arc<D>,
        processor: RequestProcessor<D>,
        port: u16,
        max_connections: usize,
        connection_timeout: std::time::Duration,
    ) -> Self {
        Self {
            monitor: Arc::new(DeviceMonitor::new(discovery.clone())),
            discovery,
            processor: Arc::new(processor),
            tcp: Arc::new(TcpServer::new(max_connections, connection_timeout)),
            port,
        }
    }

    pub fn is_running(&self) -> bool {
        self.tcp.is_running()
    }

    /// Starts device notifications, wires the device monitor's logging
    /// subscriber, then starts the TCP listener and wires every client
    /// connection onto the request processor.
    pub fn start(&self) -> Result<(), Error> {
        self.monitor.on_device_event(Box::new(|event| match event {
            DeviceEvent::Connected(d) => info!(bus_id = %d.bus_id, "device connected"),
            DeviceEvent::Disconnected(d) => info!(bus_id = %d.bus_id, "device disconnected"),
        }));

        self.monitor
            .start_monitoring()
            .map_err(|e| Error::InitializationFailed(e.to_string()))?;

        let processor = self.processor.clone();
        self.tcp.on_client_connected(Box::new(move |conn: Arc<ClientConnection>| {
            let processor_for_data = processor.clone();
            let conn_for_data = conn.clone();
            conn.on_data_received(Box::new(move |bytes| {
                match processor_for_data.process_request(bytes) {
                    Ok(response) => {
                        if let Err(e) = conn_for_data.send(&response) {
                            warn!(connection_id = conn_for_data.id(), error = %e, "failed to send response");
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = conn_for_data.id(), error = %e, "closing connection after protocol error");
                        conn_for_data.close();
                    }
                }
            }));

            conn.on_error(Box::new(move |e| {
                warn!(error = %e, "connection error");
            }));
        }));

        if let Err(e) = self.tcp.start(self.port) {
            self.monitor.stop_monitoring();
            return Err(Error::InitializationFailed(e.to_string()));
        }

        info!(port = self.port, "usbip server started");
        Ok(())
    }

    /// Stops the TCP listener, then device notifications. Best-effort on
    /// both halves.
    pub fn stop(&self) {
        if let Err(e) = self.tcp.stop() {
            error!(error = %e, "error stopping TCP server");
        }

        self.monitor.stop_monitoring();
        info!("usbip server stopped");
    }

    pub fn discovery(&self) -> &Arc<D> {
        &self.discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::mock::MockDiscovery;
    use std::time::Duration;

    #[test]
    fn start_then_stop_round_trips_cleanly() {
        let discovery = Arc::new(MockDiscovery::empty());
        let processor = RequestProcessor::new(discovery.clone(), Vec::new(), false);
        let coordinator = ServerCoordinator::new(discovery, processor, 0, 10, Duration::from_secs(5));

        coordinator.start().unwrap();
        assert!(coordinator.is_running());

        coordinator.stop();
        assert!(!coordinator.is_running());
    }
}
