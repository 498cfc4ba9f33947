use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_64_ECMA_182};

use crate::codec::CompiledDict;
use crate::error::{Error, Result};

/// The synthetic namespace that catches keys matching no explicit
/// prefix.
pub const DEFAULT_NS: &str = "default";

/// Dictionary ids are 16-bit; 0 is reserved for "no dictionary".
pub const DICT_ID_MIN: u16 = 1;
pub const DICT_ID_MAX: u16 = u16::MAX;

const DICT_EXT: &str = "dict";
const MANIFEST_EXT: &str = "mf";

const SIGNATURE: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Metadata binding one on-disk dictionary to its compiled handles.
///
/// Immutable once built into a routing table; retirement rewrites the
/// manifest on disk, the in-memory meta is replaced on the next rescan.
#[derive(Debug)]
pub struct DictMeta {
    pub id: u16,
    pub dict_path: PathBuf,
    pub manifest_path: PathBuf,
    /// Creation time, epoch seconds UTC.
    pub created: i64,
    /// Retirement time, epoch seconds UTC; 0 = active.
    pub retired: i64,
    /// Suggested compression level.
    pub level: i32,
    /// Namespace prefixes; never empty (an empty manifest list is
    /// normalized to ["default"]).
    pub prefixes: Vec<String>,
    /// CRC-64/ECMA of the dictionary bytes, parsed but not verified.
    pub signature: String,
    /// Size of the dictionary file in bytes.
    pub dict_size: u64,
    /// Compiled handles, shared through the dictionary pool.
    pub compiled: Option<Arc<CompiledDict>>,
}

impl DictMeta {
    pub fn is_retired(&self) -> bool {
        self.retired != 0
    }

    /// Pool key for this dictionary's compiled handles.
    pub fn pool_key(&self) -> String {
        self.dict_path.display().to_string()
    }

    pub fn routes_default(&self) -> bool {
        self.prefixes.iter().any(|p| p == DEFAULT_NS)
    }
}

/// File name for a dictionary id, zero-padded so listings sort.
pub fn dict_file_name(id: u16) -> String {
    format!("{id:05}.{DICT_EXT}")
}

pub fn manifest_file_name(id: u16) -> String {
    format!("{id:05}.{MANIFEST_EXT}")
}

/// Parse a dictionary file name back to its id. Non-numeric stems and
/// other extensions return None; the scanner skips them.
pub fn parse_dict_file_name(path: &Path) -> Option<u16> {
    if path.extension()?.to_str()? != DICT_EXT {
        return None;
    }
    let id: u16 = path.file_stem()?.to_str()?.parse().ok()?;
    (id >= DICT_ID_MIN).then_some(id)
}

pub fn signature_of(dict_bytes: &[u8]) -> String {
    format!("{:016x}", SIGNATURE.checksum(dict_bytes))
}

fn format_rfc3339(epoch: i64) -> String {
    match DateTime::<Utc>::from_timestamp(epoch, 0) {
        Some(t) => t.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => String::new(),
    }
}

fn parse_rfc3339(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp())
        .map_err(|e| Error::InvalidData(format!("bad timestamp '{value}': {e}")))
}

/// Render the manifest text for a meta.
fn manifest_text(meta: &DictMeta) -> String {
    let retired = if meta.retired == 0 {
        String::new()
    } else {
        format_rfc3339(meta.retired)
    };
    // A bare default routing is written as the empty field and
    // synthesized back on read; explicit mixed routings keep "default".
    let prefixes = if meta.prefixes == [DEFAULT_NS] {
        String::new()
    } else {
        meta.prefixes.join(",")
    };
    format!(
        "id = {}\ncreated = {}\nretired = {}\nlevel = {}\nsignature = {}\nprefixes = {}\n",
        meta.id,
        format_rfc3339(meta.created),
        retired,
        meta.level,
        meta.signature,
        prefixes,
    )
}

/// Parse a manifest file into a meta (compiled handles unset).
pub fn read_manifest(dir: &Path, id: u16) -> Result<DictMeta> {
    let manifest_path = dir.join(manifest_file_name(id));
    let dict_path = dir.join(dict_file_name(id));
    let text = fs::read_to_string(&manifest_path)?;

    let mut meta = DictMeta {
        id,
        dict_path,
        manifest_path,
        created: 0,
        retired: 0,
        level: 0,
        prefixes: Vec::new(),
        signature: String::new(),
        dict_size: 0,
        compiled: None,
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::InvalidData(format!(
                "manifest {}: malformed line '{line}'",
                meta.manifest_path.display()
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "id" => {
                let listed: u16 = value
                    .parse()
                    .map_err(|_| Error::InvalidData(format!("manifest id '{value}'")))?;
                if listed != id {
                    return Err(Error::InvalidData(format!(
                        "manifest {} lists id {listed}, file name says {id}",
                        meta.manifest_path.display()
                    )));
                }
            }
            "created" => meta.created = parse_rfc3339(value)?,
            "retired" => {
                meta.retired = if value.is_empty() {
                    0
                } else {
                    parse_rfc3339(value)?
                }
            }
            "level" => meta.level = value.parse().unwrap_or(0),
            "signature" => meta.signature = value.to_string(),
            "prefixes" => {
                meta.prefixes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {} // tolerate unknown keys from newer writers
        }
    }

    if meta.prefixes.is_empty() {
        meta.prefixes = vec![DEFAULT_NS.to_string()];
    }
    meta.dict_size = fs::metadata(&meta.dict_path).map(|m| m.len()).unwrap_or(0);
    Ok(meta)
}

/// Write `data` to `final_path` atomically: temp file in the same
/// directory, fsync, rename, fsync the directory.
pub fn atomic_write(dir: &Path, final_path: &Path, data: &[u8]) -> Result<()> {
    let base = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("bad path {}", final_path.display())))?;
    let tmp = dir.join(format!(".{base}.tmp.{}", std::process::id()));

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, final_path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fsync_dir(dir)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Persist a freshly trained dictionary: allocate an id, write the dict
/// bytes and the manifest, both atomically. Returns the new meta
/// (handles unset; the next directory scan compiles them).
pub fn save_dictionary(
    dir: &Path,
    dict_bytes: &[u8],
    prefixes: &[String],
    level: i32,
    created: i64,
    quarantine_s: i64,
) -> Result<DictMeta> {
    fs::create_dir_all(dir)?;
    let existing = scan_manifests(dir)?;
    let id = next_available_id(&existing, quarantine_s, created)?;

    let meta = DictMeta {
        id,
        dict_path: dir.join(dict_file_name(id)),
        manifest_path: dir.join(manifest_file_name(id)),
        created,
        retired: 0,
        level,
        prefixes: if prefixes.is_empty() {
            vec![DEFAULT_NS.to_string()]
        } else {
            prefixes.to_vec()
        },
        signature: signature_of(dict_bytes),
        dict_size: dict_bytes.len() as u64,
        compiled: None,
    };

    atomic_write(dir, &meta.dict_path, dict_bytes)?;
    atomic_write(dir, &meta.manifest_path, manifest_text(&meta).as_bytes())?;
    Ok(meta)
}

/// Mark a dictionary retired: rewrite only its manifest with
/// `retired = now`. The dict file stays on disk until quarantine.
pub fn retire_dictionary(dir: &Path, meta: &DictMeta, now: i64) -> Result<()> {
    let retired = DictMeta {
        id: meta.id,
        dict_path: meta.dict_path.clone(),
        manifest_path: meta.manifest_path.clone(),
        created: meta.created,
        retired: now,
        level: meta.level,
        prefixes: meta.prefixes.clone(),
        signature: meta.signature.clone(),
        dict_size: meta.dict_size,
        compiled: None,
    };
    atomic_write(dir, &retired.manifest_path, manifest_text(&retired).as_bytes())
}

/// Parse every manifest in the directory (active and retired alike).
/// Unreadable manifests are skipped with a warning; a directory scan
/// must not fail because one file is corrupt.
pub fn scan_manifests(dir: &Path) -> Result<Vec<DictMeta>> {
    let mut metas = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(id) = parse_dict_file_name(&path) else {
            continue;
        };
        match read_manifest(dir, id) {
            Ok(meta) => metas.push(meta),
            Err(e) => {
                tracing::warn!(id = id, error = %e, "Skipping dictionary with bad manifest");
            }
        }
    }
    Ok(metas)
}

/// Pick the smallest usable id: not held by a live dictionary and, if
/// previously retired, out of quarantine.
pub fn next_available_id(metas: &[DictMeta], quarantine_s: i64, now: i64) -> Result<u16> {
    let mut live = vec![false; DICT_ID_MAX as usize + 1];
    let mut last_retired = vec![0i64; DICT_ID_MAX as usize + 1];
    for meta in metas {
        let slot = meta.id as usize;
        if meta.is_retired() {
            last_retired[slot] = last_retired[slot].max(meta.retired);
        } else {
            live[slot] = true;
        }
    }
    for id in DICT_ID_MIN..=DICT_ID_MAX {
        let slot = id as usize;
        if live[slot] {
            continue;
        }
        if last_retired[slot] != 0 && now - last_retired[slot] < quarantine_s {
            continue;
        }
        return Ok(id);
    }
    Err(Error::IdsExhausted)
}
