//! End-to-end engine tests against in-memory source, targets and registry
//! store: dependency ordering, shared identity, idempotent re-runs,
//! self-reference patching, quarantine and cross-database checks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use area_etl::config::Config;
use area_etl::registry::{MemoryStore, RegistryStore};
use area_etl::report::RunStatus;
use area_etl::schema::{DependencyGraph, SchemaCatalog, TargetDb};
use area_etl::source::{MemorySource, RawValue, SourceReader, SourceRow};
use area_etl::target::{MemoryTarget, TargetWriter};
use area_etl::Orchestrator;

const CONFIG: &str = r#"
source:
  host: legacy.example.it
  database: AUAC
  user: etl
  password: secret
targets:
  core:
    host: pg.example.it
    database: area_core
    user: etl
    password: secret
  poa:
    host: pg.example.it
    database: area_poa
    user: etl
    password: secret
run:
  workers: 2
  registry:
    backend: memory
"#;

const CATALOG: &str = r#"
domains:
  node_activity:
    values: [EROGA, NON_EROGA, MISTA]
    normalize: upper_underscore
tables:
  - name: companies
    db: core
    source: { table: AUAC_USR.TITOLARE_MODEL }
    natural_key: [code]
    source_key: CLIENTID
    disabled_flag: DISABLED
    fields:
      - { name: id, type: uuid, nullable: false }
      - { name: code, type: text, source: CODICEUNIVOCO, nullable: false }
      - { name: name, type: text, source: DENOMINAZIONE, nullable: false }
      - { name: created_at, type: timestamp, source: CREATION, rule: created_at, nullable: false }
      - { name: updated_at, type: timestamp, source: LAST_MOD, rule: updated_at, nullable: false }
      - { name: disabled_at, type: timestamp, rule: disabled_at }
  - name: physical_structures
    db: core
    source: { table: AUAC_USR.STRUTTURA_MODEL }
    source_key: CLIENTID
    fields:
      - { name: id, type: uuid, nullable: false }
      - { name: name, type: text, source: DENOMINAZIONE, nullable: false }
      - { name: company_id, type: uuid, source: ID_TITOLARE_FK, nullable: false }
    foreign_keys:
      - { field: company_id, references: companies, nullable: false }
  - name: nodes
    db: poa
    source: { table: AUAC_ORG_USR.NODI }
    source_key: ID
    fields:
      - { name: id, type: uuid, nullable: false }
      - { name: name, type: text, source: DENOMINAZIONE, nullable: false }
      - { name: activity, type: text, source: ATTIVITA, domain: node_activity }
      - { name: company_id, type: uuid, source: ID_TITOLARE }
      - { name: parent_node_id, type: uuid, source: NODO_PADRE_ID }
    foreign_keys:
      - { field: company_id, references: companies }
      - { field: parent_node_id, references: nodes }
"#;

struct Harness {
    source: Arc<MemorySource>,
    core: Arc<MemoryTarget>,
    poa: Arc<MemoryTarget>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(MemorySource::new()),
            core: Arc::new(MemoryTarget::new()),
            poa: Arc::new(MemoryTarget::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let config = Config::from_yaml(CONFIG).expect("config");
        let catalog = SchemaCatalog::from_yaml(CATALOG).expect("catalog");
        let mut targets: HashMap<TargetDb, Arc<dyn TargetWriter>> = HashMap::new();
        targets.insert(TargetDb::Core, Arc::clone(&self.core) as Arc<dyn TargetWriter>);
        targets.insert(TargetDb::Poa, Arc::clone(&self.poa) as Arc<dyn TargetWriter>);
        Orchestrator::with_components(
            config,
            catalog,
            Arc::clone(&self.source) as Arc<dyn SourceReader>,
            targets,
            Arc::clone(&self.store) as Arc<dyn RegistryStore>,
        )
        .expect("orchestrator")
    }
}

fn stamp(day: u32) -> RawValue {
    RawValue::DateTimeUtc(Utc.with_ymd_and_hms(2021, 5, day, 10, 0, 0).unwrap())
}

fn text(s: &str) -> RawValue {
    RawValue::Text(s.to_string())
}

fn company_row(key: &str, code: &str) -> SourceRow {
    SourceRow::new(vec![
        ("CLIENTID".to_string(), text(key)),
        ("CODICEUNIVOCO".to_string(), text(code)),
        ("DENOMINAZIONE".to_string(), text("Azienda Ospedaliera")),
        ("CREATION".to_string(), stamp(1)),
        ("LAST_MOD".to_string(), stamp(2)),
    ])
}

fn structure_row(key: &str, company_key: &str) -> SourceRow {
    SourceRow::new(vec![
        ("CLIENTID".to_string(), text(key)),
        ("DENOMINAZIONE".to_string(), text("Presidio")),
        ("ID_TITOLARE_FK".to_string(), text(company_key)),
    ])
}

fn node_row(key: &str, name: &str, parent: Option<&str>, company: Option<&str>) -> SourceRow {
    let mut columns = vec![
        ("ID".to_string(), text(key)),
        ("DENOMINAZIONE".to_string(), text(name)),
        ("ATTIVITA".to_string(), text("EROGA")),
    ];
    if let Some(p) = parent {
        columns.push(("NODO_PADRE_ID".to_string(), text(p)));
    }
    if let Some(c) = company {
        columns.push(("ID_TITOLARE".to_string(), text(c)));
    }
    SourceRow::new(columns)
}

#[test]
fn test_builtin_catalog_is_valid_and_acyclic() {
    let catalog = SchemaCatalog::builtin().expect("builtin catalog");
    assert!(catalog.tables.len() >= 70);
    for db in TargetDb::ALL {
        assert!(
            catalog.tables.iter().any(|t| t.db == db),
            "no tables for database {}",
            db
        );
    }

    let order = DependencyGraph::build(&catalog)
        .topological_order()
        .expect("topological order");
    assert_eq!(order.len(), catalog.tables.len());

    let pos = order.positions();
    assert!(pos["regions"] < pos["provinces"]);
    assert!(pos["provinces"] < pos["municipalities"]);
    assert!(pos["companies"] < pos["physical_structures"]);
    assert!(pos["physical_structures"] < pos["operational_offices"]);
    assert!(pos["udo_types"] < pos["udos"]);
    assert!(pos["organigrams"] < pos["nodes"]);
    assert!(pos["cronos_plans"] < pos["cronos_plan_specialties"]);
    assert!(pos["prescriptions"] < pos["prescription_histories"]);
}

#[tokio::test]
async fn test_run_loads_tables_with_shared_identity() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);
    h.source.insert("physical_structures", vec![structure_row("S1", "T1")]);
    h.source.insert("nodes", vec![node_row("N1", "Direzione", None, Some("T1"))]);

    let report = h
        .orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.rows_loaded, 3);
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

    let companies = h.core.rows("companies");
    let structures = h.core.rows("physical_structures");
    let nodes = h.poa.rows("nodes");
    assert_eq!(companies.len(), 1);
    let company_id = companies[0].get("id").as_uuid().expect("company id");

    // The same legacy key resolves to the same UUID everywhere, across
    // tables and across databases.
    assert_eq!(structures[0].get("company_id").as_uuid(), Some(company_id));
    assert_eq!(nodes[0].get("company_id").as_uuid(), Some(company_id));
}

#[tokio::test]
async fn test_second_identical_run_writes_nothing() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);
    h.source.insert("physical_structures", vec![structure_row("S1", "T1")]);
    h.source.insert(
        "nodes",
        vec![
            node_row("N1", "Direzione", None, None),
            node_row("N2", "UOC Cardiologia", Some("N1"), None),
        ],
    );

    let orchestrator = h.orchestrator();
    let first = orchestrator.run(CancellationToken::new()).await.expect("first run");
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.rows_loaded, 4);

    let second = orchestrator.run(CancellationToken::new()).await.expect("second run");
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.rows_loaded, 0);
    assert_eq!(second.table("nodes").unwrap().patches_applied, 0);
    assert_eq!(h.core.row_count("companies"), 1);
    assert_eq!(h.poa.row_count("nodes"), 2);
}

#[tokio::test]
async fn test_rerun_with_one_new_row_writes_exactly_one() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);

    let orchestrator = h.orchestrator();
    let first = orchestrator.run(CancellationToken::new()).await.expect("first run");
    assert_eq!(first.rows_loaded, 1);

    h.source.insert(
        "companies",
        vec![company_row("T1", "050-101"), company_row("T2", "050-202")],
    );
    let second = orchestrator.run(CancellationToken::new()).await.expect("second run");
    assert_eq!(second.rows_loaded, 1);
    assert_eq!(h.core.row_count("companies"), 2);
}

#[tokio::test]
async fn test_self_references_patched_after_load() {
    let h = Harness::new();
    h.source.insert(
        "nodes",
        vec![
            node_row("N1", "Direzione", None, None),
            node_row("N2", "UOC Cardiologia", Some("N1"), None),
            node_row("N3", "UOS Emodinamica", Some("N2"), None),
        ],
    );

    let report = h
        .orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.table("nodes").unwrap().patches_applied, 2);

    let nodes = h.poa.rows("nodes");
    let id_of = |name: &str| {
        nodes
            .iter()
            .find(|r| r.get("name").as_text() == Some(name))
            .and_then(|r| r.get("id").as_uuid())
            .expect("node id")
    };
    let parent_of = |name: &str| {
        nodes
            .iter()
            .find(|r| r.get("name").as_text() == Some(name))
            .and_then(|r| r.get("parent_node_id").as_uuid())
    };

    assert_eq!(parent_of("Direzione"), None);
    assert_eq!(parent_of("UOC Cardiologia"), Some(id_of("Direzione")));
    assert_eq!(parent_of("UOS Emodinamica"), Some(id_of("UOC Cardiologia")));
}

#[tokio::test]
async fn test_unknown_parent_leaves_field_null_with_warning() {
    let h = Harness::new();
    h.source.insert(
        "nodes",
        vec![node_row("N2", "UOC Cardiologia", Some("GONE"), None)],
    );

    let report = h
        .orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.table("nodes").unwrap().patches_applied, 0);
    assert!(report.warnings.iter().any(|w| w.contains("GONE")));
    assert_eq!(h.poa.rows("nodes")[0].get("parent_node_id").as_uuid(), None);
}

#[tokio::test]
async fn test_invalid_enum_quarantines_row_and_batch_continues() {
    let h = Harness::new();
    let mut bad = node_row("N2", "Magazzino", None, None);
    bad.columns
        .retain(|(name, _)| name != "ATTIVITA");
    bad.columns
        .push(("ATTIVITA".to_string(), text("FORSE")));
    h.source
        .insert("nodes", vec![node_row("N1", "Direzione", None, None), bad]);

    let report = h
        .orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.status, RunStatus::CompletedWithQuarantine);
    assert_eq!(report.rows_loaded, 1);
    assert_eq!(report.rows_quarantined, 1);
    assert_eq!(report.quarantine.len(), 1);
    assert_eq!(report.quarantine[0].table, "nodes");
    assert_eq!(report.quarantine[0].source_key.as_deref(), Some("N2"));
    assert_eq!(h.poa.row_count("nodes"), 1);
}

#[tokio::test]
async fn test_identity_survives_across_orchestrators() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);

    h.orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("first run");
    let first_id = h.core.rows("companies")[0].get("id").as_uuid().unwrap();

    // A fresh orchestrator hydrates its registry from the shared store and
    // must mint nothing new for already-known keys.
    h.orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("second run");
    let second_id = h.core.rows("companies")[0].get("id").as_uuid().unwrap();
    assert_eq!(first_id, second_id);
    assert_eq!(h.core.row_count("companies"), 1);
}

#[tokio::test]
async fn test_dangling_cross_database_reference_is_reported() {
    let h = Harness::new();
    // The node references a company that never shows up in the source.
    h.source
        .insert("nodes", vec![node_row("N1", "Direzione", None, Some("GHOST"))]);

    let report = h
        .orchestrator()
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.status, RunStatus::Completed);
    assert!(
        report
            .warnings
            .iter()
            .any(|w| w.contains("companies") && w.contains("nodes.company_id")),
        "warnings: {:?}",
        report.warnings
    );
    // The reference is minted anyway so a later companies run converges.
    assert!(h.poa.rows("nodes")[0].get("company_id").as_uuid().is_some());
}

#[tokio::test]
async fn test_cancellation_skips_tables_and_reports_cancelled() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.orchestrator().run(cancel).await.expect("run");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.rows_loaded, 0);
    assert_eq!(h.core.row_count("companies"), 0);
}

#[tokio::test]
async fn test_module_scoping_restricts_run() {
    let h = Harness::new();
    h.source.insert("companies", vec![company_row("T1", "050-101")]);
    h.source.insert("nodes", vec![node_row("N1", "Direzione", None, None)]);

    let mut config = Config::from_yaml(CONFIG).expect("config");
    config.run.modules = vec![TargetDb::Core];
    let catalog = SchemaCatalog::from_yaml(CATALOG).expect("catalog");
    let mut targets: HashMap<TargetDb, Arc<dyn TargetWriter>> = HashMap::new();
    targets.insert(TargetDb::Core, Arc::clone(&h.core) as Arc<dyn TargetWriter>);
    let orchestrator = Orchestrator::with_components(
        config,
        catalog,
        Arc::clone(&h.source) as Arc<dyn SourceReader>,
        targets,
        Arc::clone(&h.store) as Arc<dyn RegistryStore>,
    )
    .expect("orchestrator");

    let report = orchestrator.run(CancellationToken::new()).await.expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(h.core.row_count("companies"), 1);
    assert_eq!(h.poa.row_count("nodes"), 0);
    assert!(report.table("nodes").is_none());
}
