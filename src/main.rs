use wordvm::suite::{report, run_all};

fn main() {
    let outcomes = run_all();
    print!("{}", report(&outcomes));
    if outcomes.iter().any(|o| !o.passed) {
        std::process::exit(1);
    }
}
