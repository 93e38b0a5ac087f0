//! # Schema Generator
//!
//! Prints the JSON schema of the stack configuration file.
//!
//! ## Usage
//!
//! ```bash
//! # Generate the schema for editor validation
//! cargo run --bin schemagen > schema/stack.schema.json
//!
//! # YAML instead of JSON
//! cargo run --bin schemagen -- --yaml
//! ```

use compliance_lake::StackConfig;

fn main() {
    let schema = schemars::schema_for!(StackConfig);
    let yaml = std::env::args().skip(1).any(|arg| arg == "--yaml");

    let rendered = if yaml {
        serde_yaml::to_string(&schema).map_err(|e| e.to_string())
    } else {
        serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())
    };
    match rendered {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: Failed to serialize schema: {e}");
            std::process::exit(1);
        }
    }
}
