//! Engine CA preparation.

use crate::engine::{CaPaths, Engine, EngineError};
use tracing::info;

/// How the CA was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaStatus {
    /// Both files were already on disk
    Existing,
    /// The engine generated them
    Generated,
}

/// Make sure a CA exists at `paths` and load it into the engine.
///
/// Generates when either file is missing, then always loads.
pub fn prepare_ca<E: Engine + ?Sized>(engine: &mut E, paths: &CaPaths) -> Result<CaStatus, EngineError> {
    let status = if paths.exist() {
        CaStatus::Existing
    } else {
        info!("Generating engine CA at {}", paths.cert_path.display());
        engine.generate_certs(paths)?;
        CaStatus::Generated
    };

    engine.load_and_set_ca(paths)?;
    info!("Engine CA loaded ({:?})", status);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineCall, RecordingEngine};

    fn paths_in(dir: &std::path::Path) -> CaPaths {
        CaPaths {
            cert_path: dir.join("ca.pem"),
            key_path: dir.join("ca.key"),
        }
    }

    #[test]
    fn test_generates_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let mut engine = RecordingEngine::default();

        assert_eq!(prepare_ca(&mut engine, &paths).unwrap(), CaStatus::Generated);
        assert_eq!(engine.calls(), vec![EngineCall::GenerateCerts, EngineCall::LoadCa]);
    }

    #[test]
    fn test_generates_when_key_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        std::fs::write(&paths.cert_path, "cert").unwrap();
        let mut engine = RecordingEngine::default();

        assert_eq!(prepare_ca(&mut engine, &paths).unwrap(), CaStatus::Generated);
    }

    #[test]
    fn test_existing_files_only_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        std::fs::write(&paths.cert_path, "cert").unwrap();
        std::fs::write(&paths.key_path, "key").unwrap();
        let mut engine = RecordingEngine::default();

        assert_eq!(prepare_ca(&mut engine, &paths).unwrap(), CaStatus::Existing);
        assert_eq!(engine.calls(), vec![EngineCall::LoadCa]);
    }

    #[test]
    fn test_generate_failure_skips_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(dir.path());
        let mut engine = RecordingEngine::default();
        engine.fail_on("generate_certs");

        assert!(prepare_ca(&mut engine, &paths).is_err());
        assert_eq!(engine.calls(), vec![EngineCall::GenerateCerts]);
    }
}
