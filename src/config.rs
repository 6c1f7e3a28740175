use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use sheet_store::{DEFAULT_SHEET_NAME, SheetStore};

/// Registration endpoint for the conference landing page.
#[derive(Debug, Clone, Parser)]
#[command(name = "boom-register", version, about)]
pub struct Config {
    /// Address the HTTP server listens on.
    #[arg(long, env = "BOOM_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Workbook that receives the submissions.
    #[arg(long, env = "BOOM_STORE", default_value = "boomExcel.xlsx")]
    pub store: PathBuf,

    /// Sheet inside the workbook.
    #[arg(long, env = "BOOM_SHEET", default_value = DEFAULT_SHEET_NAME)]
    pub sheet: String,

    /// Serve the landing page from this directory as well.
    #[arg(long, env = "BOOM_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,
}

impl Config {
    pub fn open_store(&self) -> SheetStore {
        SheetStore::new(&self.store).with_sheet_name(self.sheet.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn arg_default(id: &str) -> Option<String> {
        Config::command()
            .get_arguments()
            .find(|a| a.get_id().as_str() == id)
            .and_then(|a| a.get_default_values().first())
            .map(|v| v.to_string_lossy().into_owned())
    }

    // значения по умолчанию смотрим в Command, а не через parse: BOOM_* из окружения их перекрывают
    #[test]
    fn defaults_without_flags() {
        assert_eq!(arg_default("bind").as_deref(), Some("127.0.0.1:3000"));
        assert_eq!(arg_default("store").as_deref(), Some("boomExcel.xlsx"));
        assert_eq!(arg_default("sheet").as_deref(), Some("Sheet1"));
        assert_eq!(arg_default("static_dir"), None);

        let envs: Vec<_> = Config::command()
            .get_arguments()
            .filter_map(|a| a.get_env())
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            envs,
            ["BOOM_BIND", "BOOM_STORE", "BOOM_SHEET", "BOOM_STATIC_DIR"]
        );
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::try_parse_from([
            "boom-register",
            "--bind",
            "0.0.0.0:8080",
            "--store",
            "/srv/boom/registrations.xlsx",
            "--sheet",
            "Registrations",
            "--static-dir",
            "public",
        ])
        .expect("flags parse");
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.sheet, "Registrations");
        assert_eq!(cfg.static_dir, Some(PathBuf::from("public")));

        let store = cfg.open_store();
        assert_eq!(store.path(), PathBuf::from("/srv/boom/registrations.xlsx"));
        assert_eq!(store.sheet_name(), "Registrations");
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        assert!(Config::try_parse_from(["boom-register", "--bind", "localhost"]).is_err());
    }
}
