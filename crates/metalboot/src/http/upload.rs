//! ISO upload surface.
//!
//! A small HTML form for operators, the multipart upload endpoint that
//! feeds the extractor, and the uploaded-image listing. Upload responses
//! are HTML pages that bounce back to the form, matching what a browser
//! expects here; the machine-facing surface lives in `ks.rs`.

use crate::catalog::{extract, metadata};
use crate::error::ExtractError;
use crate::server::AppState;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// GET /esxi-versions response body.
#[derive(Debug, Serialize)]
pub struct EsxiVersionList {
    pub uploaded_esxi_list: HashMap<String, String>,
}

/// GET /: the upload form plus the current catalog listing.
pub async fn upload_form(State(state): State<AppState>) -> Response {
    let mut uploaded = String::new();
    for image in list_images(state.catalog.boot_dir()) {
        uploaded.push_str(&format!("<li>{image}</li>"));
    }
    for image in list_images(state.catalog.rhel_boot_dir()) {
        uploaded.push_str(&format!("<li>{image}</li>"));
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>File Upload</title>
</head>
<body>
    <h1>Upload an installer ISO file</h1>
    <form action="/upload" method="post" enctype="multipart/form-data">
        <input type="file" name="file" required>
        <button type="submit">Upload</button>
    </form>
    <br>
    <h2>Uploaded files:</h2>
    <ul>
    {uploaded}
    </ul>
</body>
</html>"#
    ))
    .into_response()
}

fn list_images(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut images: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    images.sort();
    images
}

/// POST /upload: receive the ISO, convert ZIP bundles, run the extractor.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                return handle_upload(&state, field).await;
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return error_page(
                    "Error retrieving the file",
                    "The upload form must carry a `file` field.",
                    "",
                    StatusCode::BAD_REQUEST,
                );
            }
            Err(e) => {
                error!("error retrieving the file: {}", e);
                return error_page(
                    "Error retrieving the file",
                    "Failed retrieving the file. Please confirm the following error message.",
                    &e.to_string(),
                    StatusCode::BAD_REQUEST,
                );
            }
        }
    }
}

async fn handle_upload(
    state: &AppState,
    mut field: axum::extract::multipart::Field<'_>,
) -> Response {
    let Some(file_name) = field.file_name().map(sanitize_file_name) else {
        return error_page(
            "Upload Error",
            "No file name provided.",
            "",
            StatusCode::BAD_REQUEST,
        );
    };
    if !(file_name.ends_with(".iso") || file_name.ends_with(".zip")) {
        return error_page(
            "Upload Error",
            "This file is not an `.iso` file. Only `.iso` and `.zip` files are supported.",
            "",
            StatusCode::BAD_REQUEST,
        );
    }

    let upload_path = state.catalog.iso_dir().join(&file_name);
    if let Err(e) = stream_to_disk(&mut field, &upload_path).await {
        error!("error saving the file: {}", e);
        let _ = tokio::fs::remove_file(&upload_path).await;
        return error_page(
            "Error saving the file",
            "Failed saving the file. Please confirm the following error message.",
            &e.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }

    let iso_path = if file_name.ends_with(".zip") {
        match zip_to_iso(&upload_path).await {
            Ok(path) => path,
            Err(e) => {
                error!("failed to convert zip bundle: {}", e);
                let _ = tokio::fs::remove_file(&upload_path).await;
                return error_page(
                    "Extract ISO Failed",
                    "Failed converting the ZIP bundle to an ISO image.",
                    &e.to_string(),
                    StatusCode::BAD_REQUEST,
                );
            }
        }
    } else {
        upload_path.clone()
    };

    let image = image_name(&file_name);
    if let Err(e) = extract::ingest(&state.catalog, &iso_path, &image).await {
        let status = if e.is_client_fault() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return error_page(
            "Extract ISO Failed",
            "Failed extracting ISO. Please confirm that the file is a correct installer ISO.",
            &e.to_string(),
            status,
        );
    }

    info!("file upload successfully {}", file_name);
    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta http-equiv="refresh" content="10; url=./">
    <title>File Upload</title>
</head>
<body>
    <h1>Upload an installer ISO file</h1>
    <p>File uploaded successfully: {file_name}</p>
    <p>After 10 seconds, it will automatically redirect to TOP page.</p>
    <br>
    <a href="/">Back to upload form</a>
</body>
</html>"#
    ))
    .into_response()
}

/// GET /esxi-versions: image name to ESXi version, read from each entry's
/// upgrade metadata. Entries without readable metadata are skipped.
pub async fn esxi_versions(State(state): State<AppState>) -> Response {
    let mut uploaded = HashMap::new();
    for image in list_images(state.catalog.boot_dir()) {
        let xml_path = state
            .catalog
            .boot_dir()
            .join(&image)
            .join("esxi/upgrade/metadata.xml");
        let raw = match tokio::fs::read(&xml_path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("failed to open {}: {}", xml_path.display(), e);
                continue;
            }
        };
        match metadata::parse_vum(&raw) {
            Ok(release) => {
                uploaded.insert(image, release.esx_version);
            }
            Err(e) => warn!("failed to decode {}: {}", xml_path.display(), e),
        }
    }
    Json(EsxiVersionList {
        uploaded_esxi_list: uploaded,
    })
    .into_response()
}

/// Catalog directory name for an upload: the provided file name without its
/// `.iso`/`.zip` extension.
fn image_name(file_name: &str) -> String {
    file_name
        .strip_suffix(".iso")
        .or_else(|| file_name.strip_suffix(".zip"))
        .unwrap_or(file_name)
        .to_string()
}

/// Keeps uploads from naming paths: alphanumerics, dash, underscore, dot.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

async fn stream_to_disk(
    field: &mut axum::extract::multipart::Field<'_>,
    dest: &Path,
) -> Result<(), ExtractError> {
    let mut out = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ExtractError::Iso(e.to_string()))?
    {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    Ok(())
}

/// Converts a vendor ZIP bundle to an ISO with the external PowerCLI
/// tooling. The converter is an external collaborator; this just shells out
/// and reports what it said.
async fn zip_to_iso(zip_path: &Path) -> Result<PathBuf, ExtractError> {
    let iso_path = zip_path.with_extension("iso");
    let script = format!(
        r#"$addDepo = Add-EsxSoftwareDepot {zip}
$imageName = (Get-EsxImageProfile | Where-Object {{ $_.Name -match '^ESXi-.*[0-9]-standard$' }}).Name
$imageName = $imageName | Sort-Object {{ $_.Length }} | Select-Object -First 1
$exportResult = Export-EsxImageProfile -ImageProfile $imageName -ExportToIso {iso} -Force"#,
        zip = zip_path.display(),
        iso = iso_path.display(),
    );

    let output = tokio::process::Command::new("pwsh")
        .arg("-c")
        .arg(&script)
        .output()
        .await
        .map_err(|e| ExtractError::ZipConvert(e.to_string()))?;
    if !output.status.success() {
        return Err(ExtractError::ZipConvert(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(iso_path)
}

fn error_page(title: &str, description: &str, error: &str, status: StatusCode) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta http-equiv="refresh" content="10; url=./">
    <title>{title}</title>
</head>
<body>
    <h1>{title}</h1>
    <p>{description}</p>
    <p>{error}</p>
    <p>After 10 seconds, it will automatically redirect to TOP page.</p>
    <a href="/">Back to upload form</a>
</body>
</html>"#
    );
    (status, Html(body)).into_response()
}
