pub mod config;
pub mod observer;
pub mod server;

use std::sync::Arc;

use self::{config::Config, observer::Observer};

use service::{NodeId, Realm, Service, ServiceOptions};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "blade-server.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the blade-server crate and start
/// a node directly, a function is opened to replace the main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let service = Arc::new(Service::new(ServiceOptions {
        handler: Observer::new(config.clone()),
        request_timeout: config.runtime.request_timeout,
    }));

    if let Some(master) = &config.master {
        service.set_master(
            NodeId::from(master.nodeid.as_str()),
            master.realms.iter().map(|realm| Realm::from(realm.as_str())),
        );
    } else if let Some(nodeid) = &config.node.nodeid {
        service.set_local_id(NodeId::from(nodeid.as_str()));
    }

    server::start(&config, &service).await?;

    // The node is non-blocking once the transport is up and needs to be
    // kept from exiting immediately.
    std::future::pending::<()>().await;

    Ok(())
}
