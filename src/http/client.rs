use crate::config::GlobalSettings;
use crate::error::Result;
use reqwest::Client;
use std::time::Duration;

/// Build a `reqwest::Client` from the global settings.
///
/// `max_conns_per_host` tightens the idle pool when set; reqwest bounds
/// connection reuse through the idle pool rather than capping in-flight
/// connections.
pub fn build_client(settings: &GlobalSettings) -> Result<Client> {
    let user_agent = settings
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("barrage/{}", env!("CARGO_PKG_VERSION")));

    let mut builder = Client::builder()
        .timeout(settings.timeout)
        .tcp_nodelay(true)
        .user_agent(user_agent)
        .danger_accept_invalid_certs(settings.insecure_skip_verify);

    if settings.disable_compression {
        builder = builder.no_gzip().no_brotli();
    } else {
        builder = builder.gzip(true).brotli(true);
    }

    if settings.disable_keep_alive {
        builder = builder
            .pool_max_idle_per_host(0)
            .pool_idle_timeout(Duration::ZERO);
    } else {
        let mut idle = settings.max_idle_conns_per_host as usize;
        if settings.max_conns_per_host > 0 {
            idle = idle.min(settings.max_conns_per_host as usize);
        }
        builder = builder
            .pool_max_idle_per_host(idle)
            .pool_idle_timeout(settings.idle_conn_timeout)
            .tcp_keepalive(Duration::from_secs(60));
    }

    Ok(builder.build()?)
}
