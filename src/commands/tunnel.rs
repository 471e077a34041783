use slink::config::Settings;
use slink::tunnel::{keys, TunnelAgent, TunnelCredentials};

/// Job-side bootstrap: bring up the forward tunnel back to the login
/// host. Runs as the first line of proxy-enabled batch scripts.
pub fn run_tunnel(
    service_port: u16,
    loopback_port: u16,
    login_host: &str,
    login_user: &str,
) -> anyhow::Result<()> {
    let settings = Settings::load()?;

    // Usually a no-op: the submit side authorized the key already. Jobs
    // from older submissions still benefit from catching up here.
    if let Err(e) = keys::ensure_key_auth() {
        tracing::warn!("Could not ensure tunnel key authorization: {}", e);
    }

    let agent = TunnelAgent::new(TunnelCredentials {
        otp_seed: settings.otp_seed.clone(),
        password: settings.password.clone(),
    });
    let argv = agent.build_forward_command(login_user, login_host, service_port, loopback_port)?;
    agent.execute(&argv)?;

    println!(
        "Forward tunnel up: 127.0.0.1:{} -> {}:{}",
        loopback_port, login_host, service_port
    );
    Ok(())
}
