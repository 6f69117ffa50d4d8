//! Command-line configuration shared by both binaries (§4.7).
//!
//! Mirrors `injector.c`/`injector_helper.c`'s `getopt(argc, argv, "hp:s:n")`
//! and `usage()`: `-p` is the one required flag (the local UDP port), `-s`
//! defaults to `0.0.0.0`, and `-h` prints help. Per-role fixed ports (the
//! injector's origin-side TCP 8005, the helper's client-side TCP 5678) are
//! kept as override-able fields rather than hardcoded constants so tests
//! can bind ephemeral ports instead of colliding on the original's fixed ones.

use std::net::Ipv4Addr;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Local UDP port for DHT + uTP traffic.
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Source IP to bind to.
    #[arg(short = 's', long, default_value = "0.0.0.0")]
    pub address: Ipv4Addr,

    /// Log filter, passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

#[derive(Parser, Clone, Debug)]
pub struct InjectorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Local TCP port the injector's own HTTP proxy pipeline listens on;
    /// every accepted uTP connection is spliced to a loopback connection
    /// against this port (`utp_on_accept` → `utp_connect_tcp(..., 8005)`).
    #[arg(long, default_value_t = 8005)]
    pub origin_port: u16,
}

#[derive(Parser, Clone, Debug)]
pub struct HelperArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Public-facing TCP port proxy clients connect to (`start_taking_requests`, 5678).
    #[arg(long, default_value_t = 5678)]
    pub client_port: u16,

    /// Ephemeral loopback TCP port used purely to redirect the outbound
    /// HTTP client connection onto a fresh uTP splice
    /// (`start_tcp_to_utp_redirect`); 0 lets the OS choose, as the original does.
    #[arg(long, default_value_t = 0)]
    pub redirect_port: u16,
}
