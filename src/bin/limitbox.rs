fn main() -> anyhow::Result<()> {
    limitbox::cli::run()
}
