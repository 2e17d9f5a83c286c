use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::CompileToolchain;
use crate::strategy::{
    existing_outputs, find_executable, validate_file_name, BuildContext, BuildKind, BuildOutcome,
    BuildSpec, BuildStrategy, CompileSpec, StrategyError, ToolchainCheck,
};

const CORE_FLAGS: &[&str] = &[
    "-march=thumbv6m",
    "-mcpu=cortex-m0plus",
    "-mfloat-abi=soft",
    "-mlittle-endian",
    "-mthumb",
];

const LINK_FLAGS: &[&str] = &[
    "-Wl,--reread_libs",
    "-Wl,--diag_wrap=off",
    "-Wl,--display_error_number",
    "-Wl,--warn_sections",
    "-Wl,--rom_model",
];

/// Builds MSPM0 firmware with the TI ARM clang toolchain.
///
/// The working directory gets a generated Makefile whose flags match the IDE project
/// settings, the device linker command file, and any lab sources the student did not
/// provide (copied from the lab template). Then `make clean all` runs there.
pub struct CompileStrategy {
    toolchain: CompileToolchain,
}

impl CompileStrategy {
    pub fn new(toolchain: CompileToolchain) -> Self {
        Self { toolchain }
    }

    pub fn toolchain(&self) -> &CompileToolchain {
        &self.toolchain
    }

    pub fn render_makefile(&self, source_files: &[String], output_name: &str) -> String {
        let tc = &self.toolchain;
        let cc = tc.compiler();
        let sdk = tc.sdk_root.display();

        let sources: Vec<&str> = source_files
            .iter()
            .map(String::as_str)
            .filter(|name| name.ends_with(".c"))
            .collect();
        let objects: Vec<String> = sources
            .iter()
            .map(|name| format!("{}.o", &name[..name.len() - 2]))
            .collect();

        let mut cflags: Vec<String> = CORE_FLAGS.iter().map(|f| f.to_string()).collect();
        cflags.push("-Og".to_string());
        cflags.push(format!("-D__{}__", tc.device_name));
        cflags.push("-g".to_string());
        cflags.push(format!("-I{}/source", sdk));

        let mut ldflags: Vec<String> = CORE_FLAGS.iter().map(|f| f.to_string()).collect();
        ldflags.extend(LINK_FLAGS.iter().map(|f| f.to_string()));
        ldflags.push(format!("-Wl,-i{}/lib", tc.compiler_root.display()));

        format!(
            "# Generated Makefile for {device}

# Toolchain
CC = {cc}

# Compiler flags
CFLAGS = {cflags}

# Linker flags
LDFLAGS = {ldflags}

# Libraries
LIBS = {libs}

# Source files
SRCS = {srcs}

# Object files
OBJS = {objs}

# Linker command file
CMD_FILE = {cmd}

# Output
TARGET = {out}.out

all: $(TARGET)

$(TARGET): $(OBJS) $(CMD_FILE)
\t@echo \"Linking $@...\"
\t$(CC) $(LDFLAGS) -Wl,-m\"{out}.map\" -o $@ $(OBJS) $(CMD_FILE) $(LIBS)
\t@echo \"Build complete: $@\"

%.o: %.c
\t@echo \"Compiling $<...\"
\t$(CC) $(CFLAGS) -c $< -o $@

clean:
\t@echo \"Cleaning...\"
\trm -f $(OBJS) $(TARGET) {out}.map *.d

config:
\t@echo \"Compiler: $(CC)\"
\t@echo \"Device: {device}\"
\t@echo \"SDK: {sdk}\"
\t@echo \"Sources: $(SRCS)\"
\t@echo \"Objects: $(OBJS)\"

.PHONY: all clean config
",
            device = tc.device_name,
            cc = cc.display(),
            cflags = cflags.join(" "),
            ldflags = ldflags.join(" "),
            libs = tc.driverlib().display(),
            srcs = sources.join(" "),
            objs = objects.join(" "),
            cmd = tc.linker_script_name(),
            out = output_name,
            sdk = sdk,
        )
    }

    fn template_dir(&self, ctx: &BuildContext, spec: &CompileSpec) -> PathBuf {
        match &spec.template_dir {
            Some(dir) => dir.clone(),
            None => self.toolchain.template_root.join(&ctx.lab_name),
        }
    }

    /// Copy lab sources missing from `work_dir` out of the template. Returns the names copied.
    pub async fn fill_sources(
        &self,
        work_dir: &Path,
        template_dir: &Path,
        source_files: &[String],
    ) -> Result<Vec<String>, StrategyError> {
        let mut copied = Vec::new();
        for name in source_files {
            let target = work_dir.join(name);
            if tokio::fs::try_exists(&target).await? {
                continue;
            }
            let template = template_dir.join(name);
            if tokio::fs::try_exists(&template).await? {
                tokio::fs::copy(&template, &target).await?;
                copied.push(name.clone());
            }
        }
        Ok(copied)
    }

    /// Make sure the device linker command file is in `work_dir`, copying it from the
    /// template when the student did not supply one. Returns whether a copy was made.
    pub async fn ensure_linker_script(
        &self,
        work_dir: &Path,
        template_dir: &Path,
    ) -> Result<bool, StrategyError> {
        let name = self.toolchain.linker_script_name();
        let target = work_dir.join(&name);
        if tokio::fs::try_exists(&target).await? {
            return Ok(false);
        }

        let template = template_dir.join(&name);
        if !tokio::fs::try_exists(&template).await? {
            return Err(StrategyError::MissingArtifact(format!(
                "linker script {} not found in the build directory or in {}",
                name,
                template_dir.display()
            )));
        }
        tokio::fs::copy(&template, &target).await?;
        Ok(true)
    }
}

#[async_trait]
impl BuildStrategy for CompileStrategy {
    fn kind(&self) -> BuildKind {
        BuildKind::Compile
    }

    async fn verify_toolchain(&self) -> ToolchainCheck {
        let tc = &self.toolchain;
        let compiler = tc.compiler();
        if !compiler.is_file() {
            return ToolchainCheck::failed(format!(
                "Compiler not found at {}. Set TI_COMPILER_ROOT.",
                compiler.display()
            ));
        }
        if !tc.sdk_root.is_dir() {
            return ToolchainCheck::failed(format!(
                "SDK not found at {}. Set TI_SDK_ROOT.",
                tc.sdk_root.display()
            ));
        }
        let driverlib = tc.driverlib();
        if !driverlib.is_file() {
            return ToolchainCheck::failed(format!(
                "Driver library not found at {}. Check the SDK installation.",
                driverlib.display()
            ));
        }
        if find_executable(&tc.make_program).is_none() {
            return ToolchainCheck::failed(format!(
                "{} not found on PATH",
                tc.make_program.display()
            ));
        }
        ToolchainCheck::passed("Toolchain verified successfully")
    }

    async fn build(&self, ctx: &BuildContext) -> Result<BuildOutcome, StrategyError> {
        let BuildSpec::Compile(spec) = &ctx.spec else {
            return Err(StrategyError::InvalidSpec(format!(
                "compile strategy given a {} job",
                ctx.spec.kind()
            )));
        };
        for name in &spec.source_files {
            validate_file_name(name)?;
        }
        validate_file_name(&spec.output_name)?;
        if !spec.source_files.iter().any(|name| name.ends_with(".c")) {
            return Err(StrategyError::InvalidSpec(
                "no C source files to compile".to_string(),
            ));
        }

        let template_dir = self.template_dir(ctx, spec);
        let copied = self
            .fill_sources(&ctx.work_dir, &template_dir, &spec.source_files)
            .await?;
        if !copied.is_empty() {
            tracing::debug!(job_id = %ctx.job_id, files = ?copied, "Filled sources from template");
        }

        let makefile = self.render_makefile(&spec.source_files, &spec.output_name);
        tokio::fs::write(ctx.work_dir.join("Makefile"), makefile).await?;
        self.ensure_linker_script(&ctx.work_dir, &template_dir).await?;

        let mut command = Command::new(&self.toolchain.make_program);
        command.arg("clean").arg("all").current_dir(&ctx.work_dir);
        let execution = ctx.executor().execute(ctx.job_id, command).await;

        let mut outcome = BuildOutcome::from_execution(execution);
        outcome.artifacts = existing_outputs(
            &ctx.work_dir,
            &[
                format!("{}.out", spec.output_name),
                format!("{}.map", spec.output_name),
            ],
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> CompileStrategy {
        CompileStrategy::new(CompileToolchain {
            compiler_root: PathBuf::from("/ti/cgt"),
            sdk_root: PathBuf::from("/ti/sdk"),
            ..CompileToolchain::default()
        })
    }

    #[test]
    fn makefile_lists_only_c_sources() {
        let sources = vec![
            "lab3.c".to_string(),
            "hw_interface.c".to_string(),
            "hw_interface.h".to_string(),
        ];
        let makefile = strategy().render_makefile(&sources, "Lab3");

        assert!(makefile.contains("SRCS = lab3.c hw_interface.c\n"));
        assert!(makefile.contains("OBJS = lab3.o hw_interface.o\n"));
        assert!(makefile.contains("TARGET = Lab3.out\n"));
        assert!(makefile.contains("-Wl,-m\"Lab3.map\""));
    }

    #[test]
    fn makefile_uses_toolchain_configuration() {
        let makefile = strategy().render_makefile(&["main.c".to_string()], "firmware");

        assert!(makefile.contains("CC = /ti/cgt/bin/tiarmclang\n"));
        assert!(makefile.contains("-mcpu=cortex-m0plus"));
        assert!(makefile.contains("-D__MSPM0G3507__"));
        assert!(makefile.contains("-I/ti/sdk/source"));
        assert!(makefile.contains("-Wl,-i/ti/cgt/lib"));
        assert!(makefile.contains(
            "LIBS = /ti/sdk/source/ti/driverlib/lib/ticlang/m0p/mspm0g1x0x_g3x0x/driverlib.a"
        ));
        assert!(makefile.contains("CMD_FILE = mspm0g3507.cmd"));
        // Recipes must be tab-indented for make.
        assert!(makefile.contains("\n\t$(CC) $(CFLAGS) -c $< -o $@\n"));
    }

    #[tokio::test]
    async fn verify_reports_missing_compiler() {
        let check = strategy().verify_toolchain().await;
        assert!(!check.ok);
        assert!(check.message.contains("tiarmclang"));
    }
}
