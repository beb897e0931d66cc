//! Filesystem tools. Every path goes through
//! [`ToolContext::sanitize_path`], so nothing outside the project root is
//! reachable.
//!
//! | Tool | Name | Purpose |
//! |------|------|---------|
//! | [`ReadFile`] | `read_file` | Read a UTF-8 file with size and mtime |
//! | [`WriteFile`] | `write_file` | Overwrite or patch a file |
//! | [`CopyFile`] | `copy_file` | Copy a file |
//! | [`MoveFile`] | `move_file` | Move a path, creating parents |
//! | [`RenameFile`] | `rename_file` | Rename within a folder |
//! | [`FetchFile`] | `fetch_file` | Download a URL into the project |
//! | [`ListDirectory`] | `list_directory` | JSON tree, node_modules aware |
//! | [`RemoveDirectory`] | `remove_directory` | Delete a directory |
//! | [`ResetProject`] | `reset_project` | Restore the project from a template |
//! | [`SearchReplace`] | `search_replace` | Literal or regex replace |

use crate::ToolDef;
use crate::error::ToolError;
use crate::tools::core::{Tool, ToolContext, ToolFuture, ToolOutcome, parse_tool_args};
use crate::tools::spec::ToolSpec;
use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Names `reset_project` never deletes from the root.
pub const PRESERVED_NAMES: &[&str] = &["dist", "node_modules", "gpt_dev"];

/// Files at or above this size are rewritten line by line.
pub const STREAMING_THRESHOLD: u64 = 1024 * 1024;

// ── Typed argument structs ──────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// Folder relative to the project root ('.' for the root).
    pub folder: String,
    pub filename: String,
}

#[derive(Deserialize, JsonSchema, Clone, Copy)]
pub struct ReplaceRange {
    /// First character index to replace.
    pub start: usize,
    /// Character index after the last replaced character.
    pub end: usize,
}

#[derive(Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    pub folder: String,
    pub filename: String,
    /// The exact text to write, or the text to splice in when patching.
    pub content: String,
    /// Insert `content` at this character index of the existing file.
    #[serde(default)]
    pub insert_at: Option<usize>,
    /// Replace this character range of the existing file with `content`.
    #[serde(default)]
    pub replace_range: Option<ReplaceRange>,
}

#[derive(Deserialize, JsonSchema)]
pub struct TransferArgs {
    /// Source path relative to the project root.
    pub source: String,
    /// Destination path relative to the project root.
    pub destination: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct RenameFileArgs {
    pub folder: String,
    pub old_filename: String,
    pub new_filename: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct FetchFileArgs {
    /// HTTP(S) URL of the file to download.
    pub url: String,
    /// Destination path relative to the project root.
    pub destination: String,
}

#[derive(Deserialize, JsonSchema, Default)]
pub struct ListDirectoryArgs {
    /// Folder to list (default: project root).
    #[serde(default)]
    pub folder: Option<String>,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: Option<bool>,
    /// Leave node_modules out entirely (default true).
    #[serde(default)]
    pub skip_node_modules: Option<bool>,
    /// Walk node_modules like any other directory instead of listing only
    /// its package names.
    #[serde(default)]
    pub deep_node_modules: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
pub struct RemoveDirectoryArgs {
    pub folder: String,
    /// Remove contents too (default true).
    #[serde(default)]
    pub recursive: Option<bool>,
}

#[derive(Deserialize, JsonSchema)]
pub struct ResetProjectArgs {}

#[derive(Deserialize, JsonSchema)]
pub struct SearchReplaceArgs {
    /// File path relative to the project root.
    pub path: String,
    /// Text (or regex when `regex` is true) to find.
    pub search: String,
    /// Replacement text. Regex mode supports `$1` style groups.
    pub replace: String,
    #[serde(default)]
    pub regex: bool,
}

// ── ReadFile ────────────────────────────────────────────────────────

pub struct ReadFile;

impl Tool for ReadFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("read_file")
            .purpose("Read a UTF-8 file from the project")
            .when_to_use("Before modifying a file, or to inspect a file whose path you know")
            .when_not_to_use("To browse folders, use list_directory instead")
            .parameters_for::<ReadFileArgs>()
            .example(
                "read_file(folder='src', filename='index.js')",
                "{\"content\": \"...\", \"byteLength\": 512, \"modifiedTime\": \"...\"}",
            )
            .output_format("JSON {content, byteLength, modifiedTime}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ReadFileArgs = parse_tool_args(arguments)?;
            let path = ctx.sanitize_path(&[args.folder.as_str(), args.filename.as_str()])?;
            let shown = ctx.display_path(&path);
            let meta = fs::metadata(&path)
                .await
                .map_err(|e| ToolError::io(format!("reading '{shown}'"), e))?;
            if meta.is_dir() {
                return Err(ToolError::Failed(format!(
                    "'{shown}' is a directory, not a file. Use list_directory to browse directories."
                )));
            }
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| ToolError::io(format!("reading '{shown}'"), e))?;
            let modified = meta
                .modified()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            Ok(ToolOutcome::json(&serde_json::json!({
                "content": content,
                "byteLength": meta.len(),
                "modifiedTime": modified,
            })))
        })
    }
}

// ── WriteFile ───────────────────────────────────────────────────────

pub struct WriteFile;

impl Tool for WriteFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("write_file")
            .purpose("Overwrite or patch a UTF-8 file")
            .when_to_use(
                "To create a file, replace its content, or splice text in with \
                 insert_at or replace_range. Read the file first so you do not \
                 undo concurrent changes",
            )
            .when_not_to_use("For a few textual substitutions, use search_replace instead")
            .parameters_for::<WriteFileArgs>()
            .output_format("JSON {byteLength}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: WriteFileArgs = parse_tool_args(arguments)?;
            let dir = ctx.sanitize_path(&[args.folder.as_str()])?;
            let path = ctx.sanitize_path(&[args.folder.as_str(), args.filename.as_str()])?;
            let shown = ctx.display_path(&path);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ToolError::io(format!("creating '{}'", ctx.display_path(&dir)), e))?;

            let text = if args.replace_range.is_some() || args.insert_at.is_some() {
                let existing = fs::read_to_string(&path).await.unwrap_or_default();
                patch_text(&existing, &args.content, args.replace_range, args.insert_at)?
            } else {
                args.content
            };
            fs::write(&path, &text)
                .await
                .map_err(|e| ToolError::io(format!("writing '{shown}'"), e))?;
            Ok(ToolOutcome::write(
                serde_json::json!({ "byteLength": text.len() }).to_string(),
            ))
        })
    }
}

/// Splice `content` into `existing` at character offsets. A range wins
/// over `insert_at`; offsets past the end clamp to the end. A range whose
/// start lies after its end is rejected.
pub fn patch_text(
    existing: &str,
    content: &str,
    range: Option<ReplaceRange>,
    insert_at: Option<usize>,
) -> Result<String, ToolError> {
    let (start, end) = match (range, insert_at) {
        (Some(r), _) => (r.start, r.end),
        (None, Some(p)) => (p, p),
        (None, None) => return Ok(content.to_string()),
    };
    if start > end {
        return Err(ToolError::InvalidArguments(format!(
            "'replace_range' start {start} is after end {end}"
        )));
    }
    let start = byte_offset(existing, start);
    let end = byte_offset(existing, end);
    let head = existing.get(..start).unwrap_or(existing);
    let tail = existing.get(end..).unwrap_or_default();
    Ok(format!("{head}{content}{tail}"))
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

// ── CopyFile / MoveFile / RenameFile ────────────────────────────────

pub struct CopyFile;

impl Tool for CopyFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("copy_file")
            .purpose("Copy a file from source to destination, keeping the original")
            .when_not_to_use("To relocate a file, use move_file instead")
            .parameters_for::<TransferArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: TransferArgs = parse_tool_args(arguments)?;
            let src = ctx.sanitize_path(&[args.source.as_str()])?;
            let dst = ctx.sanitize_path(&[args.destination.as_str()])?;
            ensure_parent(&dst).await?;
            fs::copy(&src, &dst)
                .await
                .map_err(|e| ToolError::io(format!("copying '{}'", args.source), e))?;
            Ok(ToolOutcome::write(format!(
                "Copied {} → {}",
                args.source, args.destination
            )))
        })
    }
}

pub struct MoveFile;

impl Tool for MoveFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("move_file")
            .purpose("Move or rename a path, creating destination folders as needed")
            .when_not_to_use("To duplicate a file, use copy_file instead")
            .parameters_for::<TransferArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: TransferArgs = parse_tool_args(arguments)?;
            let src = ctx.sanitize_path(&[args.source.as_str()])?;
            let dst = ctx.sanitize_path(&[args.destination.as_str()])?;
            ensure_parent(&dst).await?;
            fs::rename(&src, &dst)
                .await
                .map_err(|e| ToolError::io(format!("moving '{}'", args.source), e))?;
            Ok(ToolOutcome::write(format!(
                "Moved {} → {}",
                args.source, args.destination
            )))
        })
    }
}

pub struct RenameFile;

impl Tool for RenameFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("rename_file")
            .purpose("Rename a file within a folder")
            .when_not_to_use("To move a file to another folder, use move_file instead")
            .parameters_for::<RenameFileArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RenameFileArgs = parse_tool_args(arguments)?;
            let from = ctx.sanitize_path(&[args.folder.as_str(), args.old_filename.as_str()])?;
            let to = ctx.sanitize_path(&[args.folder.as_str(), args.new_filename.as_str()])?;
            fs::rename(&from, &to)
                .await
                .map_err(|e| ToolError::io(format!("renaming '{}'", args.old_filename), e))?;
            Ok(ToolOutcome::write(format!(
                "Renamed {} → {}",
                args.old_filename, args.new_filename
            )))
        })
    }
}

async fn ensure_parent(path: &Path) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::io("creating destination folder", e))?;
    }
    Ok(())
}

// ── FetchFile ───────────────────────────────────────────────────────

pub struct FetchFile {
    client: reqwest::Client,
}

impl Default for FetchFile {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchFile {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Tool for FetchFile {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("fetch_file")
            .purpose("Download a file from the internet and save it in the project")
            .when_to_use("To pull assets, data files or libraries from a URL")
            .parameters_for::<FetchFileArgs>()
            .output_format("JSON {destination, byteLength, contentType}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: FetchFileArgs = parse_tool_args(arguments)?;
            if !(args.url.starts_with("http://") || args.url.starts_with("https://")) {
                return Err(ToolError::InvalidArguments(format!(
                    "'{}' is not an HTTP(S) URL",
                    args.url
                )));
            }
            let dst = ctx.sanitize_path(&[args.destination.as_str()])?;
            let resp = self
                .client
                .get(&args.url)
                .send()
                .await
                .map_err(|e| ToolError::Failed(format!("fetching {}: {e}", args.url)))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(ToolError::Failed(format!(
                    "fetching {} returned HTTP {}",
                    args.url,
                    status.as_u16()
                )));
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ToolError::Failed(format!("reading body of {}: {e}", args.url)))?;
            ensure_parent(&dst).await?;
            fs::write(&dst, &bytes)
                .await
                .map_err(|e| ToolError::io(format!("writing '{}'", args.destination), e))?;
            Ok(ToolOutcome::write(
                serde_json::json!({
                    "destination": args.destination,
                    "byteLength": bytes.len(),
                    "contentType": content_type,
                })
                .to_string(),
            ))
        })
    }
}

// ── ListDirectory ───────────────────────────────────────────────────

/// One node of a directory listing. Directories carry `children` only when
/// they were walked.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DirEntry>>,
}

impl DirEntry {
    fn leaf(name: String) -> Self {
        Self {
            name,
            children: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WalkOptions {
    recursive: bool,
    skip_node_modules: bool,
    deep_node_modules: bool,
}

type WalkFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<Vec<DirEntry>>> + Send + 'a>>;

/// `dist` is always skipped. `node_modules` is skipped by default; otherwise
/// it is listed one level deep (package names) unless `deep_node_modules`.
fn walk(dir: PathBuf, opts: WalkOptions) -> WalkFuture<'static> {
    Box::pin(async move {
        let mut names = Vec::new();
        let mut rd = fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            names.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for (name, is_dir) in names {
            if name == "dist" {
                continue;
            }
            if name == "node_modules" {
                if opts.skip_node_modules {
                    continue;
                }
                if !opts.deep_node_modules {
                    let shallow = walk(
                        dir.join(&name),
                        WalkOptions {
                            recursive: false,
                            ..opts
                        },
                    )
                    .await?;
                    let packages = shallow.into_iter().map(|e| DirEntry::leaf(e.name)).collect();
                    out.push(DirEntry {
                        name,
                        children: Some(packages),
                    });
                    continue;
                }
            }
            if is_dir && opts.recursive {
                let children = walk(dir.join(&name), opts).await?;
                out.push(DirEntry {
                    name,
                    children: Some(children),
                });
            } else {
                out.push(DirEntry::leaf(name));
            }
        }
        Ok(out)
    })
}

pub struct ListDirectory;

impl Tool for ListDirectory {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("list_directory")
            .purpose("List directory contents as a JSON tree")
            .when_to_use("To discover files before reading or editing them")
            .when_not_to_use(
                "To inspect dependencies, read package.json rather than walking \
                 node_modules, which is skipped by default",
            )
            .parameters_for::<ListDirectoryArgs>()
            .output_format("JSON array of {name, children?}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ListDirectoryArgs = parse_tool_args(arguments)?;
            let folder = args.folder.as_deref().unwrap_or(".");
            let dir = ctx.sanitize_path(&[folder])?;
            let opts = WalkOptions {
                recursive: args.recursive.unwrap_or(false),
                skip_node_modules: args.skip_node_modules != Some(false),
                deep_node_modules: args.deep_node_modules == Some(true),
            };
            let tree = walk(dir, opts)
                .await
                .map_err(|e| ToolError::io(format!("listing '{folder}'"), e))?;
            let json = serde_json::to_string(&tree)
                .map_err(|e| ToolError::Failed(format!("encoding listing: {e}")))?;
            Ok(ToolOutcome::text(json))
        })
    }
}

// ── RemoveDirectory ─────────────────────────────────────────────────

pub struct RemoveDirectory;

impl Tool for RemoveDirectory {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("remove_directory")
            .purpose("Delete a directory, recursively by default")
            .when_not_to_use("To restore the whole project, use reset_project instead")
            .parameters_for::<RemoveDirectoryArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RemoveDirectoryArgs = parse_tool_args(arguments)?;
            let dir = ctx.sanitize_path(&[args.folder.as_str()])?;
            if dir == ctx.sanitize_path(&[])? {
                return Err(ToolError::InvalidArguments(
                    "refusing to remove the project root".into(),
                ));
            }
            let result = if args.recursive.unwrap_or(true) {
                fs::remove_dir_all(&dir).await
            } else {
                fs::remove_dir(&dir).await
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ToolError::io(format!("removing '{}'", args.folder), e)),
            }
            Ok(ToolOutcome::write(format!("Removed directory {}", args.folder)))
        })
    }
}

// ── ResetProject ────────────────────────────────────────────────────

/// Wipes the root (except [`PRESERVED_NAMES`]) and copies a template in.
pub struct ResetProject {
    template_dir: PathBuf,
}

impl ResetProject {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
        }
    }
}

impl Tool for ResetProject {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("reset_project")
            .purpose(
                "Wipe all project files except dist, node_modules and gpt_dev, \
                 then restore the default template",
            )
            .when_to_use("Only when the user explicitly asks to start over")
            .parameters_for::<ResetProjectArgs>()
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let _: ResetProjectArgs = parse_tool_args(arguments)?;
            let root = ctx.sanitize_path(&[])?;
            if !fs::try_exists(&self.template_dir).await.unwrap_or(false) {
                return Err(ToolError::NotFound(format!(
                    "template '{}'",
                    self.template_dir.display()
                )));
            }

            let mut rd = fs::read_dir(&root)
                .await
                .map_err(|e| ToolError::io("reading project root", e))?;
            let mut removed = 0usize;
            while let Some(entry) = rd
                .next_entry()
                .await
                .map_err(|e| ToolError::io("reading project root", e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if PRESERVED_NAMES.contains(&name.as_str()) {
                    continue;
                }
                let path = entry.path();
                let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                let result = if is_dir {
                    fs::remove_dir_all(&path).await
                } else {
                    fs::remove_file(&path).await
                };
                result.map_err(|e| ToolError::io(format!("removing '{name}'"), e))?;
                removed += 1;
            }

            let copied = copy_tree(self.template_dir.clone(), root)
                .await
                .map_err(|e| ToolError::io("restoring template", e))?;
            Ok(ToolOutcome::write(format!(
                "Project reset: removed {removed} entries, restored {copied} files from template"
            )))
        })
    }
}

type CopyFuture = Pin<Box<dyn Future<Output = std::io::Result<usize>> + Send>>;

/// Recursively copy `src` into `dst`. Returns the number of files copied.
fn copy_tree(src: PathBuf, dst: PathBuf) -> CopyFuture {
    Box::pin(async move {
        fs::create_dir_all(&dst).await?;
        let mut copied = 0;
        let mut rd = fs::read_dir(&src).await?;
        while let Some(entry) = rd.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copied += copy_tree(entry.path(), target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
        Ok(copied)
    })
}

// ── SearchReplace ───────────────────────────────────────────────────

enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn apply(&self, text: &str, replace: &str) -> (String, usize) {
        match self {
            Matcher::Literal(needle) => {
                let count = text.matches(needle.as_str()).count();
                if count == 0 {
                    (text.to_string(), 0)
                } else {
                    (text.replace(needle.as_str(), replace), count)
                }
            }
            Matcher::Pattern(re) => {
                let count = re.find_iter(text).count();
                if count == 0 {
                    (text.to_string(), 0)
                } else {
                    (re.replace_all(text, replace).into_owned(), count)
                }
            }
        }
    }
}

pub struct SearchReplace;

impl Tool for SearchReplace {
    fn definition(&self) -> ToolDef {
        ToolSpec::builder("search_replace")
            .purpose("Find and replace text in a file, literally or by regex")
            .when_to_use("To change specific occurrences without rewriting the file")
            .when_not_to_use("To rewrite most of a file, use write_file instead")
            .parameters_for::<SearchReplaceArgs>()
            .example(
                "search_replace(path='src/app.js', search='var ', replace='let ')",
                "{\"path\": \"src/app.js\", \"replacements\": 4, \"mode\": \"buffered\"}",
            )
            .output_format("JSON {path, replacements, mode}")
            .to_tool_def()
    }

    fn execute<'a>(&'a self, arguments: &'a str, ctx: &'a ToolContext) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: SearchReplaceArgs = parse_tool_args(arguments)?;
            if args.search.is_empty() {
                return Err(ToolError::InvalidArguments("'search' must not be empty".into()));
            }
            let matcher = if args.regex {
                Matcher::Pattern(
                    Regex::new(&args.search)
                        .map_err(|e| ToolError::InvalidArguments(format!("bad regex: {e}")))?,
                )
            } else {
                Matcher::Literal(args.search.clone())
            };
            let path = ctx.sanitize_path(&[args.path.as_str()])?;
            let size = fs::metadata(&path)
                .await
                .map_err(|e| ToolError::io(format!("reading '{}'", args.path), e))?
                .len();

            let (count, mode) = if size >= STREAMING_THRESHOLD {
                (stream_replace(&path, &matcher, &args.replace).await?, "streamed")
            } else {
                let text = fs::read_to_string(&path)
                    .await
                    .map_err(|e| ToolError::io(format!("reading '{}'", args.path), e))?;
                let (out, count) = matcher.apply(&text, &args.replace);
                if count > 0 {
                    fs::write(&path, out)
                        .await
                        .map_err(|e| ToolError::io(format!("writing '{}'", args.path), e))?;
                }
                (count, "buffered")
            };

            let body = serde_json::json!({
                "path": args.path,
                "replacements": count,
                "mode": mode,
            })
            .to_string();
            Ok(if count > 0 {
                ToolOutcome::write(body)
            } else {
                ToolOutcome::text(body)
            })
        })
    }
}

/// Rewrite a large file one line at a time through a temp file. Matches
/// cannot span lines in this mode.
async fn stream_replace(path: &Path, matcher: &Matcher, replace: &str) -> Result<usize, ToolError> {
    let tmp = path.with_extension("relay-replace.tmp");
    let input = fs::File::open(path)
        .await
        .map_err(|e| ToolError::io("opening file", e))?;
    let output = fs::File::create(&tmp)
        .await
        .map_err(|e| ToolError::io("creating temp file", e))?;
    let mut reader = BufReader::new(input);
    let mut writer = tokio::io::BufWriter::new(output);

    let mut total = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ToolError::io("reading file", e))?;
        if n == 0 {
            break;
        }
        let (out, count) = matcher.apply(&line, replace);
        total += count;
        writer
            .write_all(out.as_bytes())
            .await
            .map_err(|e| ToolError::io("writing temp file", e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| ToolError::io("writing temp file", e))?;
    drop(writer);

    if total > 0 {
        fs::rename(&tmp, path)
            .await
            .map_err(|e| ToolError::io("replacing file", e))?;
    } else {
        let _ = fs::remove_file(&tmp).await;
    }
    Ok(total)
}
