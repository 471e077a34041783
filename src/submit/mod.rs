//! Building SLURM command lines and job scripts.
//!
//! Allocation parameters are typed, validated structs rather than free-form
//! key/value bags; rendering produces either an `srun` argv or the
//! `#SBATCH` header of a batch script. Job scripts capture the job id and
//! the execution hostname into the per-job state directory, wire the proxy
//! environment when one was acquired, and release the broker when they are
//! the ones responsible for it.

use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shell_escape::escape;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Reusable allocation shape: everything that describes *what resources*
/// a job wants, independent of any one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// Optional name when stored for reuse.
    pub name: Option<String>,
    pub nodes: u32,
    pub ntasks: u32,
    /// `srun -X`: a single Ctrl-C interrupts the job instead of printing
    /// task status.
    pub disable_status: bool,
    /// `srun -u`: unbuffered output.
    pub unbuffered: bool,
    pub partition: Option<String>,
    /// GPU model to request; `None` or "any" requests untyped GPUs.
    pub gpu_type: Option<String>,
    pub num_gpus: u32,
    pub cpus_per_task: u32,
    /// Real memory per node, e.g. "40G".
    pub mem: Option<String>,
    /// Extra scheduler arguments, passed through verbatim.
    pub extra: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            name: None,
            nodes: 1,
            ntasks: 1,
            disable_status: true,
            unbuffered: true,
            partition: None,
            gpu_type: None,
            num_gpus: 1,
            cpus_per_task: 2,
            mem: None,
            extra: Vec::new(),
        }
    }
}

/// One concrete submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    pub slurm: SlurmConfig,
    pub jobname: Option<String>,
    /// Route the job's traffic through the shared proxy service.
    pub proxy: bool,
    /// Wall-clock limit, e.g. "0-01:00:00".
    pub time: String,
    /// Stdout path; `%i` expands to the job identifier.
    pub output: Option<String>,
    /// Stderr path; `%i` expands to the job identifier.
    pub error: Option<String>,
    pub mail_type: Vec<String>,
    pub mail_user: Option<String>,
}

/// Replace the `%i` placeholder with the job identifier.
pub fn resolve_identifier(text: &str, identifier: &str) -> String {
    text.replace("%i", identifier)
}

fn gpu_request(slurm: &SlurmConfig, gpus_flag: bool) -> String {
    let argname = if gpus_flag { "--gpus=" } else { "--gres=gpu:" };
    match slurm.gpu_type.as_deref() {
        None => format!("{}{}", argname, slurm.num_gpus),
        Some(t) if t.eq_ignore_ascii_case("any") => format!("{}{}", argname, slurm.num_gpus),
        Some(t) => format!("{}{}:{}", argname, t, slurm.num_gpus),
    }
}

/// Group already-split extra arguments into one option per line for
/// `#SBATCH` use: a new line starts at every `-x` / `--long` token.
pub fn group_extra_args(extra: &[String]) -> Vec<String> {
    let mut lines: Vec<Vec<&str>> = Vec::new();
    for arg in extra {
        let is_option = (arg.starts_with('-') && arg.len() == 2)
            || (arg.starts_with("--") && arg.len() > 2);
        if !is_option {
            if let Some(current) = lines.last_mut() {
                current.push(arg);
                continue;
            }
        }
        lines.push(vec![arg]);
    }
    lines
        .into_iter()
        .map(|parts| {
            parts
                .iter()
                .map(|p| escape(Cow::Borrowed(*p)).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

/// Render the `srun` invocation for this submission, without the user
/// command itself.
pub fn srun_args(config: &SubmitConfig, identifier: &str, gpus_flag: bool) -> Vec<String> {
    let slurm = &config.slurm;
    let mut args: Vec<String> = vec!["srun".into()];
    args.push("-N".into());
    args.push(slurm.nodes.to_string());
    args.push("-n".into());
    args.push(slurm.ntasks.to_string());
    if slurm.disable_status {
        args.push("-X".into());
    }
    if slurm.unbuffered {
        args.push("-u".into());
    }
    if let Some(partition) = &slurm.partition {
        args.push("-p".into());
        args.push(partition.clone());
    }
    args.push(gpu_request(slurm, gpus_flag));
    args.push("-c".into());
    args.push(slurm.cpus_per_task.to_string());
    if let Some(mem) = &slurm.mem {
        args.push("--mem".into());
        args.push(mem.clone());
    }
    args.extend(slurm.extra.iter().cloned());

    args.push("-t".into());
    args.push(config.time.clone());
    if let Some(output) = &config.output {
        args.push("-o".into());
        args.push(resolve_identifier(output, identifier));
    }
    if let Some(error) = &config.error {
        args.push("-e".into());
        args.push(resolve_identifier(error, identifier));
    }
    if let Some(jobname) = &config.jobname {
        args.push("-J".into());
        args.push(jobname.clone());
    }
    if !config.mail_type.is_empty() {
        args.push("--mail-type".into());
        args.push(config.mail_type.join(","));
    }
    if let Some(mail_user) = &config.mail_user {
        args.push("--mail-user".into());
        args.push(mail_user.clone());
    }
    args
}

/// Render the `#SBATCH` header of a batch script.
pub fn sbatch_header(config: &SubmitConfig, identifier: &str, gpus_flag: bool) -> Vec<String> {
    let slurm = &config.slurm;
    let mut lines: Vec<String> = vec!["#!/usr/bin/bash".into()];
    lines.push(format!("#SBATCH -N {}", slurm.nodes));
    lines.push(format!("#SBATCH -n {}", slurm.ntasks));
    if let Some(partition) = &slurm.partition {
        lines.push(format!("#SBATCH -p {}", partition));
    }
    lines.push(format!("#SBATCH {}", gpu_request(slurm, gpus_flag)));
    lines.push(format!("#SBATCH -c {}", slurm.cpus_per_task));
    if let Some(mem) = &slurm.mem {
        lines.push(format!("#SBATCH --mem {}", mem));
    }
    for extra in group_extra_args(&slurm.extra) {
        lines.push(format!("#SBATCH {}", extra));
    }
    lines.push(format!("#SBATCH -t {}", config.time));
    if let Some(output) = &config.output {
        lines.push(format!("#SBATCH -o {}", resolve_identifier(output, identifier)));
    }
    if let Some(error) = &config.error {
        lines.push(format!("#SBATCH -e {}", resolve_identifier(error, identifier)));
    }
    if let Some(jobname) = &config.jobname {
        lines.push(format!("#SBATCH -J {}", jobname));
    }
    if !config.mail_type.is_empty() {
        lines.push(format!("#SBATCH --mail-type {}", config.mail_type.join(",")));
    }
    if let Some(mail_user) = &config.mail_user {
        lines.push(format!("#SBATCH --mail-user {}", mail_user));
    }
    lines
}

/// How a job script reaches the acquired proxy.
#[derive(Debug, Clone)]
pub enum ProxyWiring {
    /// The job runs close enough to reach the service address directly
    /// (interactive srun on the submit host's network).
    Direct { host_ip: String, port: u16 },
    /// The job may land anywhere: bootstrap its own forward tunnel first,
    /// then talk to loopback. The script releases the broker itself once
    /// the command finishes.
    Tunneled {
        slink_exe: PathBuf,
        login_user: String,
        login_host: String,
        service_port: u16,
        loopback_port: u16,
        identifier: String,
    },
}

fn escape_join(args: &[String]) -> String {
    args.iter()
        .map(|a| escape(Cow::Borrowed(a.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// The body of a job script (everything after the `#SBATCH` header for
/// batch jobs; the whole file for srun wrappers).
pub fn script_body(command: &[String], job_dir: &Path, wiring: Option<&ProxyWiring>) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    match wiring {
        Some(ProxyWiring::Direct { host_ip, port }) => {
            lines.push(format!("export http_proxy=http://{}:{}", host_ip, port));
            lines.push(format!("export https_proxy=http://{}:{}", host_ip, port));
        }
        Some(ProxyWiring::Tunneled {
            slink_exe,
            login_user,
            login_host,
            service_port,
            loopback_port,
            ..
        }) => {
            let tunnel = vec![
                slink_exe.display().to_string(),
                "tunnel".to_string(),
                "--service-port".to_string(),
                service_port.to_string(),
                "--loopback-port".to_string(),
                loopback_port.to_string(),
                "--login-host".to_string(),
                login_host.clone(),
                "--login-user".to_string(),
                login_user.clone(),
            ];
            lines.push(escape_join(&tunnel));
            lines.push(format!("export http_proxy=http://127.0.0.1:{}", loopback_port));
            lines.push(format!("export https_proxy=http://127.0.0.1:{}", loopback_port));
        }
        None => {}
    }

    let jobid_path = job_dir.join("SLURM_JOB_ID");
    let hostname_path = job_dir.join("HOSTNAME");
    lines.push(format!(
        "echo $SLURM_JOB_ID > {}",
        escape(Cow::Owned(jobid_path.display().to_string()))
    ));
    lines.push(format!(
        "hostname > {}",
        escape(Cow::Owned(hostname_path.display().to_string()))
    ));

    lines.push(escape_join(command));

    if let Some(ProxyWiring::Tunneled {
        slink_exe,
        identifier,
        ..
    }) = wiring
    {
        // Preserve the user command's exit code across the release call.
        lines.push("rc=$?".to_string());
        lines.push(escape_join(&[
            slink_exe.display().to_string(),
            "release".to_string(),
            identifier.clone(),
        ]));
        lines.push("exit $rc".to_string());
    }

    lines
}

/// A full srun wrapper script: shebang, blank separator, body.
pub fn srun_script(command: &[String], job_dir: &Path, wiring: Option<&ProxyWiring>) -> String {
    let mut lines = vec!["#!/usr/bin/bash".to_string(), String::new()];
    lines.extend(script_body(command, job_dir, wiring));
    lines.join("\n") + "\n"
}

/// A full sbatch script: header, blank separator, body.
pub fn sbatch_script(
    config: &SubmitConfig,
    identifier: &str,
    gpus_flag: bool,
    command: &[String],
    job_dir: &Path,
    wiring: Option<&ProxyWiring>,
) -> String {
    let mut lines = sbatch_header(config, identifier, gpus_flag);
    lines.push(String::new());
    lines.extend(script_body(command, job_dir, wiring));
    lines.join("\n") + "\n"
}

/// Extract the job id from sbatch's one known success message. The
/// scheduler prints exactly `Submitted batch job <id>` (optionally with a
/// cluster suffix) on success.
pub fn parse_sbatch_output(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"^Submitted batch job (\d+)(?: on cluster .+)?$")
            .expect("static regex pattern is valid")
    });
    re.captures(output.trim())
        .map(|captures| captures[1].to_string())
}

/// Best-effort IP of this host, for the direct proxy wiring. Falls back to
/// the plain hostname when resolution fails; SLURM clusters resolve node
/// names everywhere.
pub fn host_address() -> Result<String> {
    use std::net::ToSocketAddrs;
    let hostname = crate::registry::local_hostname()?;
    match (hostname.as_str(), 0u16).to_socket_addrs() {
        Ok(mut addrs) => Ok(addrs
            .find(|a| a.is_ipv4())
            .map(|a| a.ip().to_string())
            .unwrap_or(hostname)),
        Err(_) => Ok(hostname),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_config() -> SubmitConfig {
        SubmitConfig {
            slurm: SlurmConfig {
                partition: Some("gpu".to_string()),
                gpu_type: Some("a100".to_string()),
                num_gpus: 2,
                mem: Some("40G".to_string()),
                extra: vec![
                    "--exclude".to_string(),
                    "gpu02,gpu04".to_string(),
                    "-q".to_string(),
                    "high".to_string(),
                ],
                ..SlurmConfig::default()
            },
            jobname: Some("train".to_string()),
            proxy: false,
            time: "0-02:00:00".to_string(),
            output: Some("logs/%i.out".to_string()),
            error: None,
            mail_type: vec!["END".to_string(), "FAIL".to_string()],
            mail_user: Some("alice@example.com".to_string()),
        }
    }

    #[test]
    fn srun_rendering() {
        let args = srun_args(&submit_config(), "2025-11-03_14-22-01", false);
        let joined = args.join(" ");
        assert!(joined.starts_with("srun -N 1 -n 1 -X -u -p gpu --gres=gpu:a100:2 -c 2"));
        assert!(joined.contains("--mem 40G"));
        assert!(joined.contains("--exclude gpu02,gpu04"));
        assert!(joined.contains("-t 0-02:00:00"));
        assert!(joined.contains("-o logs/2025-11-03_14-22-01.out"));
        assert!(joined.contains("-J train"));
        assert!(joined.contains("--mail-type END,FAIL"));
    }

    #[test]
    fn gpus_flag_switches_request_style() {
        let mut config = submit_config();
        let args = srun_args(&config, "id", true);
        assert!(args.contains(&"--gpus=a100:2".to_string()));

        config.slurm.gpu_type = None;
        let args = srun_args(&config, "id", false);
        assert!(args.contains(&"--gres=gpu:2".to_string()));

        config.slurm.gpu_type = Some("Any".to_string());
        let args = srun_args(&config, "id", false);
        assert!(args.contains(&"--gres=gpu:2".to_string()));
    }

    #[test]
    fn sbatch_header_rendering() {
        let lines = sbatch_header(&submit_config(), "2025-11-03_14-22-01", false);
        assert_eq!(lines[0], "#!/usr/bin/bash");
        assert!(lines.contains(&"#SBATCH -N 1".to_string()));
        assert!(lines.contains(&"#SBATCH -p gpu".to_string()));
        assert!(lines.contains(&"#SBATCH --gres=gpu:a100:2".to_string()));
        assert!(lines.contains(&"#SBATCH --exclude gpu02,gpu04".to_string()));
        assert!(lines.contains(&"#SBATCH -q high".to_string()));
        assert!(lines.contains(&"#SBATCH -o logs/2025-11-03_14-22-01.out".to_string()));
        assert!(lines.contains(&"#SBATCH --mail-type END,FAIL".to_string()));
    }

    #[test]
    fn extra_args_group_one_option_per_line() {
        let extra: Vec<String> = ["--exclude", "n1,n2", "-w", "n3", "--contiguous"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            group_extra_args(&extra),
            vec!["--exclude n1,n2", "-w n3", "--contiguous"]
        );
    }

    #[test]
    fn script_body_without_proxy() {
        let command = vec!["python".to_string(), "train.py".to_string()];
        let lines = script_body(&command, Path::new("/home/alice/.config/slink/id1"), None);
        assert_eq!(
            lines,
            vec![
                "echo $SLURM_JOB_ID > /home/alice/.config/slink/id1/SLURM_JOB_ID",
                "hostname > /home/alice/.config/slink/id1/HOSTNAME",
                "python train.py",
            ]
        );
    }

    #[test]
    fn script_body_escapes_command_arguments() {
        let command = vec![
            "python".to_string(),
            "train.py".to_string(),
            "--tag".to_string(),
            "two words".to_string(),
        ];
        let lines = script_body(&command, Path::new("/tmp/j"), None);
        assert_eq!(lines.last().unwrap(), "python train.py --tag 'two words'");
    }

    #[test]
    fn direct_wiring_exports_proxy_env() {
        let wiring = ProxyWiring::Direct {
            host_ip: "10.0.0.7".to_string(),
            port: 21042,
        };
        let lines = script_body(&["env".to_string()], Path::new("/tmp/j"), Some(&wiring));
        assert_eq!(lines[0], "export http_proxy=http://10.0.0.7:21042");
        assert_eq!(lines[1], "export https_proxy=http://10.0.0.7:21042");
    }

    #[test]
    fn tunneled_wiring_bootstraps_and_releases() {
        let wiring = ProxyWiring::Tunneled {
            slink_exe: PathBuf::from("/usr/bin/slink"),
            login_user: "alice".to_string(),
            login_host: "login01".to_string(),
            service_port: 21042,
            loopback_port: 31042,
            identifier: "2025-11-03_14-22-01".to_string(),
        };
        let lines = script_body(&["env".to_string()], Path::new("/tmp/j"), Some(&wiring));
        assert!(lines[0].starts_with("/usr/bin/slink tunnel --service-port 21042"));
        assert_eq!(lines[1], "export http_proxy=http://127.0.0.1:31042");
        let tail: Vec<_> = lines.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail[0], "rc=$?");
        assert_eq!(tail[1], "/usr/bin/slink release 2025-11-03_14-22-01");
        assert_eq!(tail[2], "exit $rc");
    }

    #[test]
    fn sbatch_output_parsing() {
        assert_eq!(
            parse_sbatch_output("Submitted batch job 123456\n"),
            Some("123456".to_string())
        );
        assert_eq!(
            parse_sbatch_output("Submitted batch job 99 on cluster alpine"),
            Some("99".to_string())
        );
        assert_eq!(parse_sbatch_output("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn identifier_substitution() {
        assert_eq!(resolve_identifier("logs/%i.out", "abc"), "logs/abc.out");
        assert_eq!(resolve_identifier("plain.out", "abc"), "plain.out");
    }
}
