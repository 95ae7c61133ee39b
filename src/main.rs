fn main() -> anyhow::Result<()> {
    camel::init_tracing();
    camel::run()
}
