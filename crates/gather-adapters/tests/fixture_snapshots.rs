// Every enabled registry source parses its checked-in fixture.

use std::path::{Path, PathBuf};

use chrono::Utc;
use gather_adapters::{build_adapters, load_source_registry, FetchedPage};
use gather_core::SourceKind;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture_for(kind: SourceKind) -> PathBuf {
    let file = match kind {
        SourceKind::GoogleCalendar => "feed.ics",
        SourceKind::PredictHq | SourceKind::Eventful => "response.json",
    };
    workspace_root()
        .join("fixtures")
        .join(kind.tag())
        .join("sample")
        .join(file)
}

#[test]
fn registry_sources_parse_their_fixtures() {
    let registry = load_source_registry(workspace_root().join("sources.yaml")).expect("registry");
    let adapters = build_adapters(&registry, &|_| Some("fixture-key".to_string())).expect("adapters");
    assert_eq!(adapters.len(), 3);

    for adapter in adapters {
        let kind = adapter.source();
        let path = fixture_for(kind);
        let page = FetchedPage {
            url: format!("fixture://{}", path.display()),
            body: std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display())),
            fetched_at: Utc::now(),
        };
        let records = adapter.parse(&page).expect("fixture parses");
        assert!(!records.is_empty(), "{kind} fixture produced no records");
        assert!(records.iter().all(|r| r.source() == kind));
    }
}
