//! Default asset transform: decides per extension whether a file is skipped,
//! copied verbatim or converted through external tools, and at which
//! compression level the result is stored.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::CookerConfig;
use crate::error::TransformError;
use crate::tools::{self, Bindings, CommandTemplate, ProcessRunner, ToolRunner, Verdict};
use crate::transform::{Disposition, Transform, TransformJob};

// -----------------------------------------------------------------------------
// Extension tables
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Model,
    Audio,
    Font,
    Text,
    Shader,
    Script,
    Video,
}

const KINDS: &[(AssetKind, &[&str])] = &[
    (AssetKind::Image, &["jpg", "jpeg", "png", "tga", "bmp", "psd", "hdr", "pic", "pnm"]),
    (
        AssetKind::Model,
        &[
            "iqm", "gltf", "gltf2", "fbx", "obj", "dae", "blend", "md3", "md5", "ms3d", "smd", "x",
            "3ds", "bvh", "dxf", "lwo",
        ],
    ),
    (AssetKind::Audio, &["wav", "mod", "xm", "flac", "ogg", "mp1", "mp3", "mid"]),
    (AssetKind::Font, &["ttf"]),
    (AssetKind::Text, &["json", "xml", "csv", "ini", "cfg", "doc", "txt", "md"]),
    (AssetKind::Shader, &["glsl", "vs", "fs"]),
    (AssetKind::Script, &["lua", "tl"]),
    (AssetKind::Video, &["mp4", "ogv", "avi", "mkv", "wmv", "mpg", "mpeg"]),
];

/// Formats that are already compressed, or are kept raw for streaming.
const STORED_RAW: &[&str] = &[
    "jpg", "jpeg", "png", "flac", "ogg", "mp1", "mp3", "mpg", "mpeg", "wav", "mid",
];

/// Header of MSVC x64 COFF objects, which share the `.obj` extension with models.
const COFF_AMD64_MAGIC: [u8; 2] = [0x64, 0x86];

pub fn classify(extension: &str) -> Option<AssetKind> {
    let ext = bare(extension);
    KINDS
        .iter()
        .find(|(_, exts)| exts.contains(&ext.as_str()))
        .map(|(kind, _)| *kind)
}

pub fn stored_raw(extension: &str) -> bool {
    STORED_RAW.contains(&bare(extension).as_str())
}

fn bare(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

/// External conversion a recognised asset needs, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// model → `.iqe` → `.iqm`
    Model,
    /// `.mid` → `.wav` → ADPCM `.wav`
    Midi,
    /// any video → MPEG-1
    Video,
    /// `.xml` → `.json`
    Xml,
}

pub fn conversion_for(extension: &str) -> Option<Conversion> {
    let ext = bare(extension);
    match classify(extension)? {
        AssetKind::Model if ext != "iqm" => Some(Conversion::Model),
        AssetKind::Audio if ext == "mid" => Some(Conversion::Midi),
        AssetKind::Video => Some(Conversion::Video),
        AssetKind::Text if ext == "xml" => Some(Conversion::Xml),
        _ => None,
    }
}

// -----------------------------------------------------------------------------
// Pipeline
// -----------------------------------------------------------------------------

/// The stock transform handed to the cooker when the application brings none.
pub struct AssetPipeline {
    root: PathBuf,
    tools_dir: PathBuf,
    soundbank: PathBuf,
    level: u32,
    echo: bool,
    record: bool,
    runner: Arc<dyn ToolRunner>,
}

impl AssetPipeline {
    pub fn new(root: &Path, config: &CookerConfig) -> Self {
        let runner = ProcessRunner::new(root).with_wine_fallback(config.wine_fallback);
        AssetPipeline {
            root: root.to_path_buf(),
            tools_dir: config.resolve(root, &config.tools_dir),
            soundbank: config.resolve(root, &config.soundbank),
            level: config.compression_level,
            echo: config.echo_tools,
            record: config.record_commands,
            runner: Arc::new(runner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    fn level_for(&self, extension: &str) -> u32 {
        if stored_raw(extension) {
            0
        } else {
            self.level
        }
    }

    fn tool(&self, name: &str) -> String {
        self.tools_dir.join(name).to_string_lossy().into_owned()
    }

    fn convert(&self, job: &mut TransformJob<'_>, conversion: Conversion) -> Result<(), TransformError> {
        let id = job.worker_id;
        let input = self.root.join(job.path);
        let mut scratch = Scratch::new();

        let result = match conversion {
            Conversion::Xml => {
                let json = scratch.claim(&self.root, format!(".temp{id}.json"));
                self.run_stage(
                    id,
                    CommandTemplate::new(&self.tool("xml2json"))
                        .arg("{{INPUT}}")
                        .stdout_to("{{OUTPUT}}"),
                    Bindings::new().path("INPUT", &input).path("OUTPUT", &json),
                    &json,
                )
                .map(|_| json)
            }
            Conversion::Video => {
                let mpg = scratch.claim(&self.root, format!(".temp{id}.mpg"));
                self.run_stage(
                    id,
                    CommandTemplate::new(&self.tool("ffmpeg"))
                        .args(&["-i", "{{INPUT}}", "{{OPTIONS}}", "{{OUTPUT}}"]),
                    Bindings::new()
                        .path("INPUT", &input)
                        .path("OUTPUT", &mpg)
                        .args(
                            "OPTIONS",
                            [
                                "-qscale:v", "4", "-y", "-c:v", "mpeg1video", "-c:a", "mp2", "-ac",
                                "1", "-b:a", "128k", "-ar", "44100", "-f", "mpeg",
                            ],
                        ),
                    &mpg,
                )
                .map(|_| mpg)
            }
            Conversion::Midi => {
                let synth = scratch.claim(&self.root, format!(".temp{id}.1.wav"));
                let adpcm = scratch.claim(&self.root, format!(".temp{id}.2.wav"));
                self.run_stage(
                    id,
                    CommandTemplate::new(&self.tool("mid2wav"))
                        .args(&["{{INPUT}}", "{{OUTPUT}}", "{{SOUNDBANK_SF2}}"]),
                    Bindings::new()
                        .path("INPUT", &input)
                        .path("OUTPUT", &synth)
                        .path("SOUNDBANK_SF2", &self.soundbank),
                    &synth,
                )
                .and_then(|_| {
                    self.run_stage(
                        id,
                        CommandTemplate::new(&self.tool("ffmpeg")).args(&[
                            "-i",
                            "{{INPUT}}",
                            "-y",
                            "-f",
                            "wav",
                            "-acodec",
                            "adpcm_ms",
                            "{{OUTPUT}}",
                        ]),
                        Bindings::new().path("INPUT", &synth).path("OUTPUT", &adpcm),
                        &adpcm,
                    )
                })
                .map(|_| adpcm)
            }
            Conversion::Model => {
                let iqe = scratch.claim(&self.root, format!(".temp{id}.iqe"));
                let iqm = scratch.claim(&self.root, format!(".temp{id}.iqm"));
                // Collada UVs come in upside down.
                let flip: &[&str] = if bare(job.extension) == "dae" { &["-U"] } else { &[] };
                self.run_stage(
                    id,
                    CommandTemplate::new(&self.tool("ass2iqe"))
                        .args(&["{{OPTIONS}}", "-o", "{{OUTPUT}}", "{{INPUT}}"]),
                    Bindings::new()
                        .path("INPUT", &input)
                        .path("OUTPUT", &iqe)
                        .args("OPTIONS", flip.iter().copied()),
                    &iqe,
                )
                .and_then(|_| {
                    self.run_stage(
                        id,
                        CommandTemplate::new(&self.tool("iqe2iqm")).args(&["{{OUTPUT}}", "{{INPUT}}"]),
                        Bindings::new().path("INPUT", &iqe).path("OUTPUT", &iqm),
                        &iqm,
                    )
                })
                .map(|_| iqm)
            }
        };

        let produced = result?;
        let mut converted = File::open(&produced).map_err(|source| TransformError::Copy {
            path: job.path.to_string(),
            source,
        })?;
        io::copy(&mut converted, &mut *job.output).map_err(|source| TransformError::Copy {
            path: job.path.to_string(),
            source,
        })?;
        Ok(())
    }

    /// Runs one tool and insists on a non-empty `output`.
    fn run_stage(
        &self,
        worker_id: usize,
        template: CommandTemplate,
        bindings: Bindings,
        output: &Path,
    ) -> Result<(), TransformError> {
        let invocation = template.expand(&bindings);
        let run = self
            .runner
            .run(&invocation)
            .map_err(|source| TransformError::Launch {
                tool: invocation.tool(),
                source,
            })?;

        let produced = fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
        tools::report(&invocation, &run, Verdict::of_stage(&run, produced), self.echo);

        if self.record {
            let log = self.root.join(tools::command_log_name(worker_id));
            if let Err(err) = tools::record_command(&log, &invocation, run.code) {
                warn!("cannot record command in {}: {err}", log.display());
            }
        }

        if produced {
            Ok(())
        } else {
            Err(TransformError::EmptyOutput {
                tool: invocation.tool(),
                output: output.to_path_buf(),
            })
        }
    }
}

impl Transform for AssetPipeline {
    fn transform(&self, job: &mut TransformJob<'_>) -> Result<Disposition, TransformError> {
        if job.extension.is_empty() {
            return Ok(Disposition::Bypass);
        }
        if bare(job.extension) == "obj" && job.header.starts_with(&COFF_AMD64_MAGIC) {
            return Ok(Disposition::Bypass);
        }
        if classify(job.extension).is_none() {
            return Ok(Disposition::Bypass);
        }

        match conversion_for(job.extension) {
            None => {
                io::copy(&mut *job.input, &mut *job.output).map_err(|source| TransformError::Copy {
                    path: job.path.to_string(),
                    source,
                })?;
            }
            Some(conversion) => {
                info!("{}", job.info);
                let started = Instant::now();
                self.convert(job, conversion)?;
                info!("{}: {:.2}s", job.path, started.elapsed().as_secs_f64());
            }
        }

        Ok(Disposition::Commit {
            level: self.level_for(job.extension),
        })
    }
}

/// Scratch files of one conversion; removed on drop whatever the outcome.
struct Scratch {
    paths: Vec<PathBuf>,
}

impl Scratch {
    fn new() -> Self {
        Scratch { paths: Vec::new() }
    }

    /// Reserves `root/name`, clearing leftovers from an interrupted run.
    fn claim(&mut self, root: &Path, name: String) -> PathBuf {
        let path = root.join(name);
        let _ = fs::remove_file(&path);
        self.paths.push(path.clone());
        path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::tools::{Invocation, ToolRun};

    /// Writes `bytes` to each invocation's output (last arg, or stdout target).
    struct FakeTools {
        outputs: Mutex<Vec<Vec<u8>>>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl FakeTools {
        fn producing(outputs: Vec<&[u8]>) -> Arc<Self> {
            Arc::new(FakeTools {
                outputs: Mutex::new(outputs.into_iter().rev().map(|o| o.to_vec()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ToolRunner for FakeTools {
        fn run(&self, invocation: &Invocation) -> io::Result<ToolRun> {
            self.seen.lock().unwrap().push(invocation.clone());
            let bytes = self.outputs.lock().unwrap().pop().unwrap_or_default();
            let target = match &invocation.stdout_to {
                Some(t) => t.clone(),
                None => match invocation.args.iter().position(|a| a == "-o") {
                    Some(i) => PathBuf::from(&invocation.args[i + 1]),
                    None if invocation.tool() == "iqe2iqm" => PathBuf::from(&invocation.args[0]),
                    None if invocation.tool() == "mid2wav" => PathBuf::from(&invocation.args[1]),
                    None => PathBuf::from(invocation.args.last().unwrap()),
                },
            };
            fs::write(target, bytes)?;
            Ok(ToolRun {
                code: 0,
                output: "ok".into(),
            })
        }
    }

    fn pipeline(root: &Path, tools: Arc<FakeTools>) -> AssetPipeline {
        let config = CookerConfig {
            echo_tools: false,
            ..CookerConfig::default()
        };
        AssetPipeline::new(root, &config).with_runner(tools)
    }

    fn run(
        pipeline: &AssetPipeline,
        path: &str,
        input: &[u8],
    ) -> (Result<Disposition, TransformError>, Vec<u8>) {
        let extension = Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let header = &input[..input.len().min(16)];
        let mut reader = Cursor::new(input.to_vec());
        let mut out = Vec::new();
        let mut job = TransformJob {
            path,
            extension: &extension,
            header,
            input: &mut reader,
            output: &mut out,
            info: "Cooking 000% test",
            worker_id: 0,
        };
        let result = pipeline.transform(&mut job);
        (result, out)
    }

    #[test]
    fn classification_tables() {
        assert_eq!(classify(".png"), Some(AssetKind::Image));
        assert_eq!(classify(".PNG"), Some(AssetKind::Image));
        assert_eq!(classify(".lua"), Some(AssetKind::Script));
        assert_eq!(classify(".exe"), None);
        assert_eq!(conversion_for(".iqm"), None);
        assert_eq!(conversion_for(".dae"), Some(Conversion::Model));
        assert_eq!(conversion_for(".mid"), Some(Conversion::Midi));
        assert_eq!(conversion_for(".ogg"), None);
        assert_eq!(conversion_for(".mkv"), Some(Conversion::Video));
        assert_eq!(conversion_for(".xml"), Some(Conversion::Xml));
        assert_eq!(conversion_for(".json"), None);
        assert!(stored_raw(".png"));
        assert!(stored_raw(".mid"));
        assert!(!stored_raw(".txt"));
    }

    #[test]
    fn copies_plain_assets_and_picks_level() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), FakeTools::producing(vec![]));

        let (result, out) = run(&pipeline, "docs/readme.txt", b"some text");
        assert_eq!(result.unwrap(), Disposition::Commit { level: 6 });
        assert_eq!(out, b"some text");

        let (result, out) = run(&pipeline, "art/hero.png", b"\x89PNG....");
        assert_eq!(result.unwrap(), Disposition::Commit { level: 0 });
        assert_eq!(out, b"\x89PNG....");
    }

    #[test]
    fn bypasses_unsupported_and_extensionless() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(dir.path(), FakeTools::producing(vec![]));

        let (result, out) = run(&pipeline, "Makefile", b"all:");
        assert_eq!(result.unwrap(), Disposition::Bypass);
        assert!(out.is_empty());

        let (result, _) = run(&pipeline, "bin/tool.exe", b"MZ");
        assert_eq!(result.unwrap(), Disposition::Bypass);

        let (result, _) = run(&pipeline, "build/main.obj", b"\x64\x86\x03\x00");
        assert_eq!(result.unwrap(), Disposition::Bypass);
    }

    #[test]
    fn model_conversion_chains_two_tools() {
        let dir = tempdir().unwrap();
        let tools = FakeTools::producing(vec![b"iqe text".as_slice(), b"IQM binary".as_slice()]);
        let pipeline = pipeline(dir.path(), tools.clone());

        let (result, out) = run(&pipeline, "models/crate.dae", b"<COLLADA/>");
        assert_eq!(result.unwrap(), Disposition::Commit { level: 6 });
        assert_eq!(out, b"IQM binary");

        let seen = tools.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].tool(), "ass2iqe");
        assert_eq!(seen[0].args[0], "-U");
        assert_eq!(seen[1].tool(), "iqe2iqm");
        assert!(!dir.path().join(".temp0.iqe").exists());
        assert!(!dir.path().join(".temp0.iqm").exists());
    }

    #[test]
    fn empty_intermediate_output_fails_the_file() {
        let dir = tempdir().unwrap();
        let tools = FakeTools::producing(vec![b"".as_slice()]);
        let pipeline = pipeline(dir.path(), tools.clone());

        let (result, out) = run(&pipeline, "music/theme.mid", b"MThd");
        assert!(matches!(result, Err(TransformError::EmptyOutput { .. })));
        assert!(out.is_empty());
        assert_eq!(tools.seen.lock().unwrap().len(), 1);
        assert!(!dir.path().join(".temp0.1.wav").exists());
    }

    #[test]
    fn xml_goes_through_stdout_redirect() {
        let dir = tempdir().unwrap();
        let tools = FakeTools::producing(vec![b"{\"a\":1}".as_slice()]);
        let pipeline = pipeline(dir.path(), tools.clone());

        let (result, out) = run(&pipeline, "data/items.xml", b"<a>1</a>");
        assert_eq!(result.unwrap(), Disposition::Commit { level: 6 });
        assert_eq!(out, b"{\"a\":1}");
        let seen = tools.seen.lock().unwrap();
        assert_eq!(seen[0].stdout_to, Some(dir.path().join(".temp0.json")));
    }
}
