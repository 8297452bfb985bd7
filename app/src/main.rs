mod sim;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let hints_path = std::env::args().nth(1);
    sim::run(hints_path.as_deref())
}
