use slink::config::Settings;
use slink::proxy::ProxyService;
use slink::ReleaseOutcome;

pub fn run_release(identifier: &str) -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let service = ProxyService::from_settings(settings)?;

    match service.release(identifier)? {
        ReleaseOutcome::Stopped => println!("Shared proxy service stopped."),
        ReleaseOutcome::StillInUse => println!("Released; other jobs still use the service."),
        ReleaseOutcome::QueueBusy => {
            println!("Released; the queue still shows related jobs, service kept alive.")
        }
        ReleaseOutcome::NotRegistered => {
            println!("No service registered for this host; nothing to do.")
        }
    }
    Ok(())
}
