use clap::{Parser, Subcommand};
use std::env;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
pub fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con el master del Hive")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Envía un job nuevo
    Submit {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Más alta se planifica antes
        #[arg(long, default_value_t = 0)]
        priority: i32,

        #[arg(long, default_value_t = 1)]
        cores: u32,

        /// Memoria en MB
        #[arg(long, default_value_t = 256)]
        memory: u64,

        /// Archivo con el estado serializado del algoritmo
        #[arg(long, value_name = "ARCHIVO")]
        payload: Option<String>,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los jobs activos
    Jobs,
    /// Cancela un job en cola o en ejecución
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los slaves conocidos
    Slaves,
    /// Última foto de estadísticas de la flota
    Stats,
    /// Pide una limpieza inmediata
    Cleanup,
}
