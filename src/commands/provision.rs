use slink::config::Settings;
use slink::provision::Provisioner;

pub async fn run_provision() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let provisioner = Provisioner::new(Settings::bin_dir()?)?;
    provisioner.ensure_all(&settings).await?;
    println!(
        "Proxy assets ready under {}",
        provisioner.data_dir().display()
    );
    Ok(())
}
