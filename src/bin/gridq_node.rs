use std::{collections::HashMap, error::Error, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;

use gridq::{
    NodeConfig, QueryKind, QueryRequest, QueryServer,
    marshal::{ClassRegistry, DeploymentMode, NodeId, QueryArg, UnmarshalContext},
    protocol::{ExecutionError, FieldMeta, QueryExecutor, QueryResponder, QueryRows, Row},
};

#[derive(Debug, Parser)]
#[command(version, about = "Serves cache queries from an in-memory table", long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[arg(long, default_value = "gridq.toml")]
    config: PathBuf,
    /// Listen for new connections at address
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long)]
    node_id: Option<u64>,
    #[arg(long)]
    workers: Option<usize>,
    /// Attach class metadata to outbound user code
    #[arg(long)]
    deployment: bool,
    /// Rows to generate in the "people" cache
    #[arg(long, default_value_t = 100)]
    populate: usize,
}

/// Caches of rows held in memory; answers scan queries only.
struct MemoryCaches {
    caches: HashMap<String, Vec<Row>>,
}

impl MemoryCaches {
    fn populate(size: usize) -> Self {
        let people = (0..size)
            .map(|i| {
                vec![
                    QueryArg::Long(i as i64),
                    QueryArg::Text(format!("person-{i}")),
                    QueryArg::Int(18 + (i % 60) as i32),
                ]
            })
            .collect();

        Self {
            caches: HashMap::from([("people".to_owned(), people)]),
        }
    }
}

impl QueryExecutor for MemoryCaches {
    fn execute(
        &self,
        request: &QueryRequest,
        _ctx: &UnmarshalContext<'_>,
    ) -> Result<QueryRows, ExecutionError> {
        let name = request.cache_name().unwrap_or_default();
        let rows = self
            .caches
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownCache(name.to_owned()))?;

        if request.kind() != Some(QueryKind::Scan) {
            return Err(ExecutionError::Unsupported(format!(
                "{:?} queries",
                request.kind()
            )));
        }

        Ok(QueryRows::new(rows.clone().into_iter()).with_metadata(vec![
            FieldMeta::new("id", "long"),
            FieldMeta::new("name", "string"),
            FieldMeta::new("age", "int"),
        ]))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(id) = cli.node_id {
        config.node_id = NodeId(id);
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.deployment {
        config.deployment = DeploymentMode::Enabled;
    }
    config.validate()?;

    ctrlc::set_handler(|| {
        info!("interrupted, shutting down");
        std::process::exit(0);
    })?;

    let responder = QueryResponder::new(
        Arc::new(MemoryCaches::populate(cli.populate)),
        config.marshaller(),
        Arc::new(ClassRegistry::new()),
    );
    let server = QueryServer::bind(config.listen, responder, config.workers, config.window_size)?;

    info!("node {} ready", config.node_id);
    server.listen()?;
    Ok(())
}
