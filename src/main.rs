fn main() -> Result<(), Box<dyn std::error::Error>> {
    salang_lib::run(std::env::args().collect())
}
