use slink::config::Settings;
use slink::Registry;

pub fn run_status(json: bool) -> anyhow::Result<()> {
    let registry = Registry::open(&Settings::state_dir()?);
    let snapshot = registry.snapshot()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    if snapshot.is_empty() {
        println!("No shared services registered.");
        return Ok(());
    }

    for (key, record) in &snapshot {
        let pid = record
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "external".to_string());
        let consumers: Vec<&str> = record.consumers.iter().map(String::as_str).collect();
        println!(
            "{}  pid={}  port={}  consumers=[{}]",
            key,
            pid,
            record.port,
            consumers.join(", ")
        );
    }
    Ok(())
}
