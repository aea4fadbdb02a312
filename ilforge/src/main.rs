use std::process::ExitCode;

use ilforge::loader;
use ilforge::Rewriter;

/// Loads the assembly named on the command line, prints its summary, and — if a
/// second path is given — writes it back out unchanged, exercising the full
/// load/rewrite/save round trip. A convenience for manual smoke testing; the real
/// product surface is the (out of scope) service this crate is a library for.
fn main() -> ExitCode {
	let mut args = std::env::args().skip(1);
	let Some(input) = args.next() else {
		eprintln!("usage: ilforge-cli <assembly.dll> [output.dll]");
		return ExitCode::FAILURE;
	};

	let model = match loader::load(&input) {
		Ok(model) => model,
		Err(e) => {
			eprintln!("failed to load {input}: {e}");
			return ExitCode::FAILURE;
		},
	};

	let summary = model.summary();
	println!("name:      {}", summary.full_name);
	println!("mvid:      {}", summary.mvid);
	println!(
		"version:   {}.{}.{}.{}",
		summary.version.major, summary.version.minor, summary.version.build, summary.version.revision
	);
	println!("framework: {}", summary.target_framework_moniker.as_deref().unwrap_or("(unknown)"));
	println!("types:     {}", summary.type_count);
	println!("depends on:");
	for name in &summary.dependencies {
		println!("  {name}");
	}

	if let Some(output) = args.next() {
		let rewriter = Rewriter::new(model);
		if let Err(e) = rewriter.save(&output) {
			eprintln!("failed to save {output}: {e}");
			return ExitCode::FAILURE;
		}
		println!("wrote {output}");
	}

	ExitCode::SUCCESS
}
