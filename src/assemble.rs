use std::io::{Cursor, Write};

use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::orchestrator::{BatchOutcome, GenerationResult};

/// Requested delivery shape for a settled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Zip,
    Base64List,
}

impl ReturnType {
    pub fn parse(value: &str) -> Option<ReturnType> {
        match value.trim().to_lowercase().as_str() {
            "zip" => Some(ReturnType::Zip),
            "base64_list" | "base64-list" => Some(ReturnType::Base64List),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("Archive write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Archive write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered list payload: `null` entries keep the slot position of failed
/// variants so callers can retry exactly the missing expressions.
#[derive(Debug, Serialize)]
pub struct ImageListPayload {
    pub images: Vec<Option<String>>,
    pub message: String,
}

pub fn archive_file_name(character_id: &str) -> String {
    format!("standing_set_{character_id}.zip")
}

fn entry_name(character_id: &str, index: usize, slug: &str) -> String {
    format!("{character_id}_expr{:02}_{slug}.png", index + 1)
}

/// Deterministic archive: one entry per produced slot, named by slot number
/// and expression label, in slot order. Failed slots are skipped.
pub fn build_archive(result: &GenerationResult) -> Result<Vec<u8>, AssembleError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0usize;
    for variant in &result.variants {
        let Some(bytes) = variant.final_image() else {
            continue;
        };
        writer.start_file(
            entry_name(&result.character_id, variant.index, variant.label.slug),
            options,
        )?;
        writer.write_all(bytes)?;
        entries += 1;
    }

    let cursor = writer.finish()?;
    info!(
        character_id = %result.character_id,
        entries,
        skipped = result.variants.len() - entries,
        "assembled archive"
    );
    Ok(cursor.into_inner())
}

/// Base64 list with positional `null` markers for failed slots.
pub fn build_image_list(result: &GenerationResult) -> ImageListPayload {
    let images: Vec<Option<String>> = result
        .variants
        .iter()
        .map(|variant| {
            variant
                .final_image()
                .map(|bytes| general_purpose::STANDARD.encode(bytes))
        })
        .collect();

    let produced = images.iter().filter(|entry| entry.is_some()).count();
    let message = match result.outcome {
        BatchOutcome::Complete => format!(
            "Successfully generated {produced} images for {}",
            result.character_id
        ),
        BatchOutcome::Partial => format!(
            "Generated {produced} of {} images for {}",
            result.variants.len(),
            result.character_id
        ),
    };

    ImageListPayload { images, message }
}
