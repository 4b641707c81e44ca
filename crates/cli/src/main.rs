//! sqlcache CLI binary

fn main() {
    let cli = sqlcache_cli::cli::parse();
    std::process::exit(sqlcache_cli::run(&cli));
}
