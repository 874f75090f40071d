//! Allocates one of each object kind near a live code address and prints
//! where everything landed. Run with `RUST_LOG=debug` to watch the region
//! and cave decisions.

use hookmem::MethodAllocator;

fn main() -> hookmem::Result<()> {
    env_logger::init();

    let allocator = MethodAllocator::with_os();

    // Use this function's own address as the hook target stand-in.
    let target = main as usize;

    let indirect = allocator.create_indirect(target)?;
    indirect.write(target);
    println!("indirect slot at {:#x} -> {:#x}", indirect.address(), indirect.read());
    println!(
        "distance to target: {:#x}",
        indirect.address().abs_diff(target)
    );

    let routine = allocator.create_routine(&[0x90, 0x90, 0xC3])?;
    println!("routine at {:#x} ({} bytes)", routine.address(), routine.size());

    let mut chain = allocator.create_linked_array()?;
    chain.add_node(routine.address())?;
    println!(
        "chain root at {:#x}, {} node(s)",
        chain.root_address(),
        chain.node_count()
    );

    drop(chain);
    drop(routine);
    drop(indirect);
    allocator.dispose();
    Ok(())
}
