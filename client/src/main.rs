mod cli;

use anyhow::{bail, Result};
use clap::Parser;
use common::{
    Ack, CleanupResponse, JobInfo, JobSubmitRequest, JobSubmitResponse, SlaveInfo,
    StatisticsSnapshot,
};
use reqwest::{Client, Response};

use cli::{master_base_url, Cli, Commands};

/// Falla con el mensaje de error del master si la respuesta no es 2xx.
async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    match body.get("error").and_then(|e| e.as_str()) {
        Some(msg) => bail!("{status}: {msg}"),
        None => bail!("el master respondió {status}"),
    }
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {}", job.state);
    if let Some(reason) = job.failure_reason {
        println!("  motivo: {:?}", reason);
    }
    println!("  prioridad: {}", job.priority);
    println!("  recursos: {} cores, {} MB", job.required_cores, job.required_memory);
    println!("  intentos: {}", job.attempt_count);
    if let Some(slave) = &job.assigned_slave_id {
        println!("  slave: {}", slave);
    }
    println!("  encolado: {}", job.enqueued_at);
    if let Some(t) = job.started_at {
        println!("  iniciado: {}", t);
    }
    if let Some(t) = job.finished_at {
        println!("  terminado: {}", t);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            name,
            priority,
            cores,
            memory,
            payload,
        } => {
            let payload = match payload {
                Some(path) => tokio::fs::read(&path).await?,
                None => Vec::new(),
            };
            let url = format!("{}/api/v1/jobs", base_url);
            let req = JobSubmitRequest {
                name,
                priority,
                required_cores: cores,
                required_memory: memory,
                payload,
            };
            let resp = check(client.post(&url).json(&req).send().await?).await?;
            let JobSubmitResponse { job_id } = resp.json().await?;
            println!("Job creado: {}", job_id);
        }
        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{id}", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("No se encontró el job con id {id}");
            } else {
                let job: JobInfo = check(resp).await?.json().await?;
                print_job(&job);
            }
        }
        Commands::Jobs => {
            let url = format!("{}/api/v1/jobs", base_url);
            let jobs: Vec<JobInfo> = check(client.get(&url).send().await?).await?.json().await?;
            if jobs.is_empty() {
                println!("No hay jobs activos");
            }
            for job in jobs {
                println!(
                    "{}  {:<12} prio={:<3} {:>2} cores {:>6} MB  intentos={}  {}",
                    job.id,
                    job.state.to_string(),
                    job.priority,
                    job.required_cores,
                    job.required_memory,
                    job.attempt_count,
                    job.name
                );
            }
        }
        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/jobs/{id}/cancel", base_url);
            let _: Ack = check(client.post(&url).send().await?).await?.json().await?;
            println!("Job {} cancelado", id);
        }
        Commands::Slaves => {
            let url = format!("{}/api/v1/slaves", base_url);
            let slaves: Vec<SlaveInfo> = check(client.get(&url).send().await?).await?.json().await?;

            println!("Slaves:");
            for s in slaves {
                println!("- id: {}", s.id);
                println!("  host: {} ({})", s.hostname, s.endpoint);
                println!("  estado: {:?}", s.state);
                println!("  cores: {}/{} libres", s.free_cores, s.total_cores);
                println!("  memoria: {}/{} MB libres", s.free_memory, s.total_memory);
                println!("  cpu: {:.1}%", s.cpu_utilization);
                println!("  último heartbeat: {}", s.last_heartbeat);
                println!(
                    "  jobs: {} iniciados, {} terminados, {} fallidos",
                    s.jobs_started, s.jobs_finished, s.jobs_failed
                );
                if let Some(avg) = s.avg_job_ms() {
                    println!("  duración media: {:.0} ms", avg);
                }
            }
        }
        Commands::Stats => {
            let url = format!("{}/api/v1/statistics", base_url);
            let stats: StatisticsSnapshot =
                check(client.get(&url).send().await?).await?.json().await?;

            println!("Estadísticas ({}):", stats.generated_at);
            println!("  slaves online: {}", stats.online_slaves);
            println!(
                "  cores: {}/{} usados ({:.1}%)",
                stats.used_cores, stats.total_cores, stats.fleet_utilization_pct
            );
            println!("  memoria: {}/{} MB usados", stats.used_memory, stats.total_memory);
            println!("  cpu media: {:.1}%", stats.avg_cpu_utilization);
            println!(
                "  cola: {}  esperando: {}  calculando: {}",
                stats.queue_depth, stats.waiting_jobs, stats.calculating_jobs
            );
            println!(
                "  desde la foto anterior: {} terminados, {} fallidos",
                stats.jobs_finished, stats.jobs_failed
            );
            for s in &stats.slaves {
                println!(
                    "  - {} {:?}: {:.0}% cores, {} jobs",
                    s.slave_id,
                    s.state,
                    s.core_utilization_pct(),
                    s.assigned_jobs
                );
            }
        }
        Commands::Cleanup => {
            let url = format!("{}/api/v1/cleanup", base_url);
            let resp: CleanupResponse = check(client.post(&url).send().await?).await?.json().await?;
            if resp.performed {
                println!(
                    "Limpieza hecha: {} jobs archivados, {} slaves purgados",
                    resp.archived_jobs, resp.purged_slaves
                );
            } else {
                println!("Ya se limpió dentro del intervalo, no se hizo nada");
            }
        }
    }

    Ok(())
}
