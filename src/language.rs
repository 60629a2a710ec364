use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// A programming language a room can be set to.
///
/// The wire tag (`serde`, `Display`, `FromStr`) is the lowercase identifier
/// shared by the room protocol and the execution service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Javascript,
    Java,
    Cpp,
    Csharp,
    Typescript,
    Go,
    Rust,
}

impl Language {
    /// Every supported language, in selector order.
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Javascript,
        Language::Java,
        Language::Cpp,
        Language::Csharp,
        Language::Typescript,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Csharp => "csharp",
            Language::Typescript => "typescript",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }

    /// Human-facing name for selectors and headers.
    pub fn label(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::Javascript => "JavaScript",
            Language::Java => "Java",
            Language::Cpp => "C++",
            Language::Csharp => "C#",
            Language::Typescript => "TypeScript",
            Language::Go => "Go",
            Language::Rust => "Rust",
        }
    }

    /// Runtime version identifier accepted by the execution service.
    pub fn runtime_version(&self) -> &'static str {
        match self {
            Language::Python => "3.10.0",
            Language::Javascript => "18.15.0",
            Language::Java => "15.0.2",
            Language::Cpp => "10.2.0",
            Language::Csharp => "6.12.0",
            Language::Typescript => "5.0.3",
            Language::Go => "1.16.2",
            Language::Rust => "1.68.2",
        }
    }

    /// Canonical starter source seeded whenever this language is selected.
    pub fn template(&self) -> &'static str {
        match self {
            Language::Python => PYTHON_TEMPLATE,
            Language::Javascript => JAVASCRIPT_TEMPLATE,
            Language::Java => JAVA_TEMPLATE,
            Language::Cpp => CPP_TEMPLATE,
            Language::Csharp => CSHARP_TEMPLATE,
            Language::Typescript => TYPESCRIPT_TEMPLATE,
            Language::Go => GO_TEMPLATE,
            Language::Rust => RUST_TEMPLATE,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == wanted)
            .ok_or_else(|| format!("Unknown language: {}", s))
    }
}

// -- Starter templates --------------------------------------------------------

const PYTHON_TEMPLATE: &str = "# Welcome to Python\n\ndef greeting(name):\n    return f\"Hello, {name}!\"\n\n# Main program\nif __name__ == \"__main__\":\n    print(greeting(\"World\"))\n    # Add your code here";

const JAVASCRIPT_TEMPLATE: &str = "// Welcome to JavaScript\n\nfunction greeting(name) {\n    return `Hello, ${name}!`;\n}\n\n// Main program\nconsole.log(greeting(\"World\"));\n// Add your code here";

const JAVA_TEMPLATE: &str = "// Welcome to Java\n\npublic class Main {\n    public static String greeting(String name) {\n        return \"Hello, \" + name + \"!\";\n    }\n    \n    public static void main(String[] args) {\n        System.out.println(greeting(\"World\"));\n        // Add your code here\n    }\n}";

const CPP_TEMPLATE: &str = "// Welcome to C++\n#include <iostream>\n#include <string>\n\nusing namespace std;\n\nstring greeting(const string& name) {\n    return \"Hello, \" + name + \"!\";\n}\n\nint main() {\n    cout << greeting(\"World\") << endl;\n    // Add your code here\n    return 0;\n}";

const CSHARP_TEMPLATE: &str = "// Welcome to C#\nusing System;\n\nclass Program {\n    static string Greeting(string name) {\n        return $\"Hello, {name}!\";\n    }\n    \n    static void Main() {\n        Console.WriteLine(Greeting(\"World\"));\n        // Add your code here\n    }\n}";

const TYPESCRIPT_TEMPLATE: &str = "// Welcome to TypeScript\n\nfunction greeting(name: string): string {\n    return `Hello, ${name}!`;\n}\n\n// Main program\nconsole.log(greeting(\"World\"));\n// Add your code here";

const GO_TEMPLATE: &str = "// Welcome to Go\npackage main\n\nimport (\n    \"fmt\"\n)\n\nfunc greeting(name string) string {\n    return fmt.Sprintf(\"Hello, %s!\", name)\n}\n\nfunc main() {\n    fmt.Println(greeting(\"World\"))\n    // Add your code here\n}";

const RUST_TEMPLATE: &str = "// Welcome to Rust\n\nfn greeting(name: &str) -> String {\n    format!(\"Hello, {}!\", name)\n}\n\nfn main() {\n    println!(\"{}\", greeting(\"World\"));\n    // Add your code here\n}";
