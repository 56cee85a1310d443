use std::sync::Arc;

use localhome::config::Settings;
use localhome::connection::Dispatcher;
use localhome::discovery::DiscoveryCache;
use localhome::http_proxy;
use localhome::mitm::TlsRegistry;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();

    let discovery = Arc::new(DiscoveryCache::with_defaults(
        settings.cache_ttl,
        settings.debug,
    ));
    let tls_registry = Arc::new(TlsRegistry::new(discovery.clone(), settings.listen_port));
    let dispatcher = Arc::new(Dispatcher {
        discovery,
        tls_registry,
        http_client: http_proxy::new_client(),
        listen_port: settings.listen_port,
        debug: settings.debug,
    });

    let addr = (settings.bind_host, settings.listen_port);
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!(
                "failed to bind {}:{}: {e}",
                settings.bind_host, settings.listen_port
            );
            std::process::exit(1);
        }
    };
    eprintln!(
        "localhome listening on http://{}:{}",
        settings.bind_host, settings.listen_port
    );

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("accept error: {e}");
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.handle(stream).await;
        });
    }
}
