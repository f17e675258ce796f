//! Per-language server commands and workspace scaffolds.
//!
//! A session's language tag selects the child-process command template and
//! the minimal project skeleton materialized into the workspace. The skeleton
//! matters: JDT LS refuses to offer completion inside a root with no project
//! descriptor.

use std::io;
use std::path::Path;

use uuid::Uuid;

/// Substituted with the session workspace path when a command is resolved.
pub const WORKSPACE_PLACEHOLDER: &str = "{workspace}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Java,
    Python,
}

impl Language {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "java" => Some(Self::Java),
            "python" => Some(Self::Python),
            _ => None,
        }
    }

    pub const fn tag(self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Python => "python",
        }
    }

    /// LSP `languageId` for documents in this language.
    pub const fn language_id(self) -> &'static str {
        self.tag()
    }

    /// Workspace-relative path of the scaffolded entry file.
    pub const fn main_file(self) -> &'static str {
        match self {
            Self::Java => "src/Main.java",
            Self::Python => "main.py",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Build the JDT LS launch command. `-data` receives the workspace
/// placeholder so one template serves every session.
pub fn java_command(java_bin: &Path, launcher_jar: &Path, config_dir: &Path) -> Vec<String> {
    vec![
        java_bin.display().to_string(),
        "-Declipse.application=org.eclipse.jdt.ls.core.id1".into(),
        "-Dosgi.bundles.defaultStartLevel=4".into(),
        "-Declipse.product=org.eclipse.jdt.ls.core.product".into(),
        "-Dlog.level=ALL".into(),
        "-Xms1G".into(),
        "-Xmx2G".into(),
        "-jar".into(),
        launcher_jar.display().to_string(),
        "-configuration".into(),
        config_dir.display().to_string(),
        "-data".into(),
        WORKSPACE_PLACEHOLDER.into(),
        "--add-modules=ALL-SYSTEM".into(),
        "--add-opens".into(),
        "java.base/java.util=ALL-UNNAMED".into(),
        "--add-opens".into(),
        "java.base/java.lang=ALL-UNNAMED".into(),
    ]
}

pub fn python_command() -> Vec<String> {
    vec!["pylsp".into()]
}

/// Materialize the project skeleton for `language` inside `workspace`.
pub async fn scaffold(language: Language, workspace: &Path, session_id: &str) -> io::Result<()> {
    match language {
        Language::Java => scaffold_java(workspace, session_id).await,
        Language::Python => scaffold_python(workspace).await,
    }
}

const MAIN_JAVA: &str = r#"public class Main {
    public static void main(String[] args) {
        System.out.println("Hello, World!");
    }
}
"#;

const CLASSPATH_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<classpath>
    <classpathentry kind="src" path="src"/>
    <classpathentry kind="con" path="org.eclipse.jdt.launching.JRE_CONTAINER"/>
    <classpathentry kind="output" path="bin"/>
</classpath>
"#;

async fn scaffold_java(workspace: &Path, session_id: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(workspace.join("src")).await?;
    tokio::fs::write(workspace.join("src/Main.java"), MAIN_JAVA).await?;

    // Sessions may share a parent data directory, and Eclipse rejects two
    // projects with the same <name>. Suffix random hex to keep them distinct
    // even across reconnects of the same session id.
    let nonce = Uuid::new_v4().simple().to_string();
    let project_name = format!("{session_id}_{}", &nonce[..8]);
    let project_xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<projectDescription>
    <name>{project_name}</name>
    <comment></comment>
    <projects></projects>
    <buildSpec>
        <buildCommand>
            <name>org.eclipse.jdt.core.javabuilder</name>
            <arguments></arguments>
        </buildCommand>
    </buildSpec>
    <natures>
        <nature>org.eclipse.jdt.core.javanature</nature>
    </natures>
</projectDescription>
"#
    );
    tokio::fs::write(workspace.join(".project"), project_xml).await?;
    tokio::fs::write(workspace.join(".classpath"), CLASSPATH_XML).await?;
    Ok(())
}

async fn scaffold_python(workspace: &Path) -> io::Result<()> {
    tokio::fs::write(
        workspace.join("main.py"),
        "print(\"Hello, World!\")\n",
    )
    .await
}
