use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "invalid_input", "missing outPath", None),
    };

    match backup::export_workspace_bundle(&workspace, &PathBuf::from(&out_path)) {
        Ok(export) => {
            info!(path = %out_path, "bundle exported");
            ok(
                &req.id,
                json!({
                    "path": out_path,
                    "bundleFormat": export.bundle_format,
                    "dbSha256": export.db_sha256
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        ),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => return err(&req.id, "invalid_input", "missing inPath", None),
    };
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // Drop the open handle before replacing the database file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => {
            // A rejected bundle never touches the database file; reopen it.
            state.db = db::open_db(&workspace).ok();
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": in_path.to_string_lossy() })),
            );
        }
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            info!(path = %in_path.to_string_lossy(), "bundle imported");
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace.to_string_lossy(),
                    "dbSha256": import.db_sha256
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportBundle" => Some(handle_export_bundle(state, req)),
        "backup.importBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
