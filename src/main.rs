use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use shader_weaver::doc::{FsDocumentSource, load_document_from_path};
use shader_weaver::{WeaverCompiler, WeaverConfig};

#[derive(Debug, Default, Clone)]
struct Cli {
    config: Option<PathBuf>,
    root: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    markup: bool,
    inputs: Vec<PathBuf>,
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --config"));
                };
                cli.config = Some(PathBuf::from(v));
                i += 2;
            }
            "--root" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --root"));
                };
                cli.root = Some(PathBuf::from(v));
                i += 2;
            }
            "--outputdir" | "--output-dir" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --outputdir"));
                };
                cli.output_dir = Some(PathBuf::from(v));
                i += 2;
            }
            "--markup" => {
                cli.markup = true;
                i += 1;
            }
            other if other.starts_with("--") => {
                return Err(anyhow!(
                    "unknown argument: {other} (supported: --config <weaver.json>, --root <dir>, --outputdir <dir>, --markup, <shader.json>...)"
                ));
            }
            path => {
                cli.inputs.push(PathBuf::from(path));
                i += 1;
            }
        }
    }
    if cli.inputs.is_empty() {
        return Err(anyhow!("no shader documents given"));
    }
    Ok(cli)
}

fn output_path_under(output_dir: &Path, input: &Path, markup: bool) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shader".to_string());
    let ext = if markup { "xml" } else { "json" };
    output_dir.join(format!("{stem}.woven.{ext}"))
}

fn weave_one(compiler: &WeaverCompiler, input: &Path, cli: &Cli) -> Result<()> {
    let doc = load_document_from_path(input)?;
    let woven = compiler
        .compile_shader(&doc)
        .with_context(|| format!("failed to weave {}", input.display()))?;
    let text = if cli.markup {
        woven.to_string()
    } else {
        serde_json::to_string_pretty(&woven)?
    };
    match &cli.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let out = output_path_under(dir, input, cli.markup);
            std::fs::write(&out, text)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("[weave] saved: {}", out.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&args)?;

    let config = match &cli.config {
        Some(path) => WeaverConfig::from_path(path)?,
        None => WeaverConfig::default(),
    };
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    let compiler = WeaverCompiler::new(config, Arc::new(FsDocumentSource::new(root)));

    let mut failed = 0usize;
    for input in &cli.inputs {
        if let Err(e) = weave_one(&compiler, input, &cli) {
            eprintln!("[weave] {e:#}");
            failed += 1;
        }
    }
    let diagnostics = compiler.reporter().diagnostics();
    if !diagnostics.is_empty() {
        println!("[weave] {} diagnostics", diagnostics.len());
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} shaders failed", cli.inputs.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_flags_and_inputs() {
        let args: Vec<String> = ["--config", "w.json", "--outputdir", "out", "a.json", "b.json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cli = parse_cli(&args).unwrap();
        assert_eq!(cli.config.as_ref().unwrap(), &PathBuf::from("w.json"));
        assert_eq!(cli.output_dir.as_ref().unwrap(), &PathBuf::from("out"));
        assert_eq!(cli.inputs.len(), 2);
        assert!(!cli.markup);
    }

    #[test]
    fn parse_cli_rejects_unknown_flags() {
        let args = vec!["--bogus".to_string()];
        assert!(parse_cli(&args).is_err());
        assert!(parse_cli(&[]).is_err());
    }

    #[test]
    fn output_names_follow_input_stem() {
        let p = output_path_under(Path::new("out"), Path::new("dir/water.json"), false);
        assert_eq!(p, PathBuf::from("out/water.woven.json"));
    }
}
