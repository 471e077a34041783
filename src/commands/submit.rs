use crate::cli::SubmitArgs;
use shell_escape::escape;
use slink::config::{self, Settings};
use slink::proxy::ProxyService;
use slink::queue;
use slink::submit::{self, ProxyWiring, SubmitConfig};
use slink::tunnel::keys;
use slink::Error;
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Srun,
    Batch,
}

/// Render the submission without executing anything.
pub fn run_print(args: &SubmitArgs, batch: bool) -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let identifier = config::new_identifier();
    let cfg = args.to_submit_config();

    if batch {
        for line in submit::sbatch_header(&cfg, &identifier, settings.gpus_flag) {
            println!("{}", line);
        }
        println!();
        println!("{}", escape_join(&args.command));
    } else {
        let mut argv = submit::srun_args(&cfg, &identifier, settings.gpus_flag);
        argv.extend(args.command.iter().cloned());
        println!("{}", escape_join(&argv));
    }
    Ok(())
}

pub async fn run_submit(args: &SubmitArgs, mode: SubmitMode) -> anyhow::Result<()> {
    let settings = Settings::load()?;
    if let Err(e) = settings.prune_job_dirs() {
        tracing::warn!("Failed to prune old job directories: {}", e);
    }

    let identifier = config::new_identifier();
    let cfg = args.to_submit_config();
    let job_dir = Settings::job_dir(&identifier)?;
    fs::create_dir_all(&job_dir)?;

    match mode {
        SubmitMode::Srun => run_srun(&settings, cfg, &identifier, &job_dir, &args.command).await,
        SubmitMode::Batch => run_batch(&settings, cfg, &identifier, &job_dir, &args.command).await,
    }
}

/// Interactive submission: the proxy (if any) lives and dies with this
/// process: acquire before srun, release after it returns.
async fn run_srun(
    settings: &Settings,
    cfg: SubmitConfig,
    identifier: &str,
    job_dir: &Path,
    command: &[String],
) -> anyhow::Result<()> {
    let service = if cfg.proxy {
        Some(ProxyService::from_settings(settings.clone())?)
    } else {
        None
    };

    let wiring = match &service {
        Some(service) => {
            let endpoint = service.acquire(identifier).await?;
            Some(ProxyWiring::Direct {
                host_ip: submit::host_address()?,
                port: endpoint.port,
            })
        }
        None => None,
    };

    let script_path = job_dir.join("script.sh");
    fs::write(
        &script_path,
        submit::srun_script(command, job_dir, wiring.as_ref()),
    )?;

    let mut argv = submit::srun_args(&cfg, identifier, settings.gpus_flag);
    argv.push("bash".to_string());
    argv.push(script_path.display().to_string());
    tracing::debug!(command = %escape_join(&argv), "running srun");

    let status = Command::new(&argv[0]).args(&argv[1..]).status();

    // The job is over either way; let go of the proxy before reporting.
    if let Some(service) = &service {
        if let Err(e) = service.release(identifier) {
            tracing::warn!("Failed to release proxy service: {}", e);
        }
    }

    let status = status.map_err(|source| Error::LaunchFailed {
        command: "srun".to_string(),
        source,
    })?;
    if !status.success() {
        return Err(Error::JobExited {
            code: status.code().unwrap_or(1),
        }
        .into());
    }
    Ok(())
}

/// Batch submission: the job runs later, possibly on another host, so the
/// script carries its own tunnel bootstrap and its own release call.
async fn run_batch(
    settings: &Settings,
    mut cfg: SubmitConfig,
    identifier: &str,
    job_dir: &Path,
    command: &[String],
) -> anyhow::Result<()> {
    let service = if cfg.proxy {
        Some(ProxyService::from_settings(settings.clone())?)
    } else {
        None
    };

    let wiring = match &service {
        Some(service) => {
            let endpoint = service.acquire(identifier).await?;

            // The quiescence check recognizes jobs by the marker name; only
            // an explicit user name overrides it.
            if cfg.jobname.is_none() {
                cfg.jobname = Some(queue::marker_job_name(identifier));
            }

            // The key works from any node that shares the home directory;
            // authorize it now so the job never hits a prompt it can't
            // answer without configured secrets.
            if let Err(e) = keys::ensure_key_auth() {
                tracing::warn!("Could not pre-authorize tunnel key: {}", e);
            }

            Some(ProxyWiring::Tunneled {
                slink_exe: slink_exe()?,
                login_user: login_user()?,
                login_host: slink::registry::local_hostname()?,
                service_port: endpoint.port,
                // The compute node binds the same number locally; the
                // allocator range is far from anything jobs listen on.
                loopback_port: endpoint.port,
                identifier: identifier.to_string(),
            })
        }
        None => None,
    };

    let script_path = job_dir.join("script.sh");
    fs::write(
        &script_path,
        submit::sbatch_script(
            &cfg,
            identifier,
            settings.gpus_flag,
            command,
            job_dir,
            wiring.as_ref(),
        ),
    )?;

    if let Some(output) = &cfg.output {
        println!(
            "Stdout filepath: {}",
            submit::resolve_identifier(output, identifier)
        );
    }
    if let Some(error) = &cfg.error {
        println!(
            "Stderr filepath: {}",
            submit::resolve_identifier(error, identifier)
        );
    }

    let output = Command::new("sbatch")
        .arg(&script_path)
        .output()
        .map_err(|source| Error::LaunchFailed {
            command: "sbatch".to_string(),
            source,
        });

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            rollback(service.as_ref(), identifier);
            return Err(e.into());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        print!("{}", stdout);
    }

    let job_id = submit::parse_sbatch_output(&stdout);
    match (output.status.success(), job_id) {
        (true, Some(job_id)) => {
            // The queue cross-check and the daemon-less cleanup both key
            // off this file.
            fs::write(job_dir.join("SLURM_JOB_ID"), &job_id)?;
            tracing::info!(identifier, job_id = %job_id, "batch job submitted");
            Ok(())
        }
        _ => {
            // Submission failed: the job will never run, so its claim on
            // the proxy must not outlive this call.
            rollback(service.as_ref(), identifier);
            Err(Error::Submit(format!(
                "sbatch exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into())
        }
    }
}

fn rollback(service: Option<&ProxyService>, identifier: &str) {
    if let Some(service) = service {
        if let Err(e) = service.release(identifier) {
            tracing::warn!("Failed to roll back proxy acquisition: {}", e);
        }
    }
}

fn escape_join(args: &[String]) -> String {
    args.iter()
        .map(|a| escape(Cow::Borrowed(a.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn slink_exe() -> slink::Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| Error::Config(format!("Could not determine own executable path: {}", e)))
}

fn login_user() -> slink::Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| Error::Config("Neither USER nor LOGNAME is set".to_string()))
}
