use mdbm::{Mdbm, MdbmConfig, OpenFlags, StoreFlags, StoreMode};

fn main() -> mdbm::MdbmResult<()> {
    println!("MDBM Demo");

    let path = std::env::temp_dir().join(format!("mdbm-demo-{}.mdbm", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let config = MdbmConfig::default();
    let mut db = Mdbm::open(&path, OpenFlags::RDWR | OpenFlags::CREAT, &config)?;

    db.store(b"alice", b"28", StoreMode::Insert, StoreFlags::empty())?;
    db.store(b"bob", b"35", StoreMode::Insert, StoreFlags::empty())?;
    db.store(b"carol", b"22", StoreMode::Insert, StoreFlags::empty())?;

    println!("inserted 3 keys");

    for key in ["alice", "bob", "carol"] {
        let value = db.fetch(key.as_bytes())?;
        println!(
            "  {key} -> {}",
            value.map(|v| String::from_utf8_lossy(&v).into_owned()).unwrap_or_default()
        );
    }

    match db.store(b"alice", b"29", StoreMode::Insert, StoreFlags::empty())? {
        mdbm::StoreOutcome::Exists => println!("insert on existing key reported Exists, as expected"),
        mdbm::StoreOutcome::Stored => unreachable!(),
    }

    db.store(b"alice", b"29", StoreMode::Replace, StoreFlags::empty())?;
    println!("  alice -> {:?}", db.fetch(b"alice")?.map(|v| String::from_utf8_lossy(&v).into_owned()));

    db.delete(b"bob")?;
    println!("deleted bob: {:?}", db.fetch(b"bob")?);

    let mut count = 0;
    for pair in db.iter() {
        let (key, value) = pair?;
        println!("  iter: {} = {}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
        count += 1;
    }
    println!("iterated {count} live entries");

    db.close()?;
    Ok(())
}
