use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DrcToolchain;
use crate::strategy::report::summarize_report;
use crate::strategy::{
    existing_outputs, find_executable, validate_file_name, validate_label, BuildContext,
    BuildKind, BuildOutcome, BuildSpec, BuildStrategy, DrcSpec, RuleSet, StrategyError,
    ToolchainCheck,
};

/// Board sides exported as previews, with the layers each one shows.
const PREVIEW_LAYERS: &[(&str, &str)] = &[
    ("top", "F.Cu,Edge.Cuts,F.SilkS"),
    ("bottom", "B.Cu,Edge.Cuts,B.SilkS"),
];

const PCB_EXTENSION: &str = "kicad_pcb";
const RULES_EXTENSION: &str = "kicad_dru";

/// Runs KiCad design-rule checks and renders board previews.
///
/// One DRC pass per rule set writes `drc_<slug>.json` and an HTML report; the
/// previews go through SVG export and PNG conversion. A run succeeds when the
/// pipeline completes. Violations never fail the job; they are summarised in the
/// job output and left in the reports.
pub struct DrcStrategy {
    toolchain: DrcToolchain,
}

impl DrcStrategy {
    pub fn new(toolchain: DrcToolchain) -> Self {
        Self { toolchain }
    }

    pub fn render_makefile(&self, pcb_file: &str, rule_sets: &[RuleSet]) -> String {
        let tc = &self.toolchain;
        let kicad = tc.kicad_cli.display();
        let pcb_stem = pcb_file
            .strip_suffix(&format!(".{}", PCB_EXTENSION))
            .unwrap_or(pcb_file);
        // KiCad only picks up rules from a file named after the board.
        let sidecar = format!("{}.{}", pcb_stem, RULES_EXTENSION);

        let mut outputs = Vec::new();
        let mut intermediates = Vec::new();
        let mut recipes = String::new();

        for rules in rule_sets {
            let slug = rules.slug();
            let label = rules.label();
            let json = format!("drc_{}.json", slug);
            let html = format!("drc_{}.html", slug);
            recipes.push_str(&format!(
                "
# DRC: {label}
{json}: {pcb} {rules}
\t@echo \"Running DRC ({label})...\"
\tcp -f {rules} {sidecar}
\t-{kicad} pcb drc --format json --output {json} {pcb} 2>&1 || true
\trm -f {sidecar}

{html}: {json}
\t@echo \"Generating HTML report ({label})...\"
\t{python} {script} {json} {html} --title \"{label}\"
",
                label = label,
                json = json,
                html = html,
                pcb = pcb_file,
                rules = rules.file,
                sidecar = sidecar,
                kicad = kicad,
                python = tc.python.display(),
                script = tc.report_script.display(),
            ));
            intermediates.push(json);
            outputs.push(html);
        }

        for (side, layers) in PREVIEW_LAYERS {
            let svg = format!("preview_{}.svg", side);
            let png = format!("preview_{}.png", side);
            recipes.push_str(&format!(
                "
{svg}: {pcb}
\t@echo \"Exporting {side} view...\"
\t{kicad} pcb export svg --output {svg} --layers {layers} --page-size-mode 2 --exclude-drawing-sheet {pcb}

{png}: {svg}
\t@echo \"Converting {side} view to PNG...\"
\t{rsvg} -d {dpi} -p {dpi} {svg} -o {png}
",
                svg = svg,
                png = png,
                side = side,
                layers = layers,
                pcb = pcb_file,
                kicad = kicad,
                rsvg = tc.rsvg_convert.display(),
                dpi = tc.preview_dpi,
            ));
            intermediates.push(svg);
            outputs.push(png);
        }

        let rule_files: Vec<&str> = rule_sets.iter().map(|r| r.file.as_str()).collect();
        let all_files: Vec<&str> = intermediates
            .iter()
            .chain(outputs.iter())
            .map(String::as_str)
            .collect();

        format!(
            "# Generated Makefile for KiCad DRC and previews
# PCB file: {pcb}

KICAD_CLI = {kicad}
RSVG_CONVERT = {rsvg}
PYTHON = {python}

PCB = {pcb}

ALL_OUTPUTS = {outputs}

all: $(ALL_OUTPUTS)
\t@echo \"All DRC reports and previews generated.\"
{recipes}
clean:
\trm -f {all_files}
\trm -f {sidecar}

config:
\t@echo \"KiCad CLI: $(KICAD_CLI)\"
\t@echo \"PCB file:  $(PCB)\"
\t@echo \"DRU files: {rule_files}\"
\t@echo \"Outputs:   $(ALL_OUTPUTS)\"

.PHONY: all clean config
",
            pcb = pcb_file,
            kicad = kicad,
            rsvg = tc.rsvg_convert.display(),
            python = tc.python.display(),
            outputs = outputs.join(" "),
            recipes = recipes,
            all_files = all_files.join(" "),
            sidecar = sidecar,
            rule_files = rule_files.join(" "),
        )
    }

    /// Output files of a pipeline run, in the order they are produced.
    pub fn output_names(rule_sets: &[RuleSet]) -> Vec<String> {
        let mut names = Vec::new();
        for rules in rule_sets {
            let slug = rules.slug();
            names.push(format!("drc_{}.json", slug));
            names.push(format!("drc_{}.html", slug));
        }
        for (side, _) in PREVIEW_LAYERS {
            names.push(format!("preview_{}.svg", side));
            names.push(format!("preview_{}.png", side));
        }
        names
    }

    /// The declared board file, or the first `*.kicad_pcb` in the directory.
    pub async fn locate_pcb(work_dir: &Path, spec: &DrcSpec) -> Result<String, StrategyError> {
        if let Some(name) = &spec.pcb_file {
            validate_file_name(name)?;
            if !tokio::fs::try_exists(work_dir.join(name)).await? {
                return Err(StrategyError::MissingArtifact(format!(
                    "PCB file {} not found",
                    name
                )));
            }
            return Ok(name.clone());
        }

        let name = list_with_extension(work_dir, PCB_EXTENSION)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                StrategyError::MissingArtifact("no .kicad_pcb file in the submission".to_string())
            })?;
        validate_file_name(&name)?;
        Ok(name)
    }

    /// The declared rule sets, or every `*.kicad_dru` in the directory. Each file must exist.
    pub async fn resolve_rule_sets(
        work_dir: &Path,
        spec: &DrcSpec,
        pcb_file: &str,
    ) -> Result<Vec<RuleSet>, StrategyError> {
        let rule_sets = if spec.rule_sets.is_empty() {
            let stem = pcb_file
                .strip_suffix(&format!(".{}", PCB_EXTENSION))
                .unwrap_or(pcb_file);
            let sidecar = format!("{}.{}", stem, RULES_EXTENSION);
            list_with_extension(work_dir, RULES_EXTENSION)
                .await?
                .into_iter()
                // The board's own sidecar is overwritten by every pass.
                .filter(|name| *name != sidecar)
                .map(|name| RuleSet::new(name, None))
                .collect()
        } else {
            spec.rule_sets.clone()
        };

        if rule_sets.is_empty() {
            return Err(StrategyError::MissingArtifact(
                "no .kicad_dru design rule files".to_string(),
            ));
        }
        for rules in &rule_sets {
            validate_file_name(&rules.file)?;
            validate_label(rules.label())?;
            if !tokio::fs::try_exists(work_dir.join(&rules.file)).await? {
                return Err(StrategyError::MissingArtifact(format!(
                    "design rule file {} not found",
                    rules.file
                )));
            }
        }
        Ok(rule_sets)
    }
}

async fn list_with_extension(dir: &Path, extension: &str) -> Result<Vec<String>, StrategyError> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl BuildStrategy for DrcStrategy {
    fn kind(&self) -> BuildKind {
        BuildKind::Drc
    }

    async fn verify_toolchain(&self) -> ToolchainCheck {
        let tc = &self.toolchain;
        let mut missing = Vec::new();
        if find_executable(&tc.kicad_cli).is_none() {
            missing.push(format!("kicad-cli not found (looked for: {})", tc.kicad_cli.display()));
        }
        if find_executable(&tc.rsvg_convert).is_none() {
            missing.push(format!(
                "rsvg-convert not found (looked for: {})",
                tc.rsvg_convert.display()
            ));
        }
        if find_executable(&tc.python).is_none() {
            missing.push(format!("python not found (looked for: {})", tc.python.display()));
        }
        if !tc.report_script.is_file() {
            missing.push(format!(
                "DRC report script not found at: {}",
                tc.report_script.display()
            ));
        }
        if find_executable(&tc.make_program).is_none() {
            missing.push(format!("{} not found on PATH", tc.make_program.display()));
        }

        if missing.is_empty() {
            ToolchainCheck::passed("PCB toolchain verified successfully")
        } else {
            ToolchainCheck::failed(format!("Missing tools: {}", missing.join("; ")))
        }
    }

    async fn build(&self, ctx: &BuildContext) -> Result<BuildOutcome, StrategyError> {
        let BuildSpec::Drc(spec) = &ctx.spec else {
            return Err(StrategyError::InvalidSpec(format!(
                "DRC strategy given a {} job",
                ctx.spec.kind()
            )));
        };

        let pcb = Self::locate_pcb(&ctx.work_dir, spec).await?;
        let rule_sets = Self::resolve_rule_sets(&ctx.work_dir, spec, &pcb).await?;
        tracing::debug!(
            job_id = %ctx.job_id,
            pcb = %pcb,
            rule_sets = rule_sets.len(),
            "Prepared DRC pipeline"
        );

        let makefile = self.render_makefile(&pcb, &rule_sets);
        tokio::fs::write(ctx.work_dir.join("Makefile"), makefile).await?;

        let mut command = Command::new(&self.toolchain.make_program);
        command.arg("all").current_dir(&ctx.work_dir);
        let execution = ctx.executor().execute(ctx.job_id, command).await;

        let mut outcome = BuildOutcome::from_execution(execution);
        if outcome.success {
            outcome.stdout.push('\n');
            for rules in &rule_sets {
                let report = ctx.work_dir.join(format!("drc_{}.json", rules.slug()));
                let line = match summarize_report(&report).await {
                    Ok(summary) => format!("DRC {}: {}\n", rules.label(), summary),
                    Err(e) => format!("DRC {}: no report ({})\n", rules.label(), e),
                };
                outcome.stdout.push_str(&line);
            }
        }
        outcome.artifacts = existing_outputs(&ctx.work_dir, &Self::output_names(&rule_sets));
        Ok(outcome)
    }
}
