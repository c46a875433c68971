use machine::elf::{Elf, ElfBuilder, ElfError, ProgramType, SectionFlags};
use machine::fs::{FileSystem, MemFileSystem};
use machine::{PhysMemory, PAGE_SIZE};

fn open_image(image: Vec<u8>) -> Box<dyn machine::OpenFile> {
    let fs = MemFileSystem::new();
    fs.add_file("prog", image);
    fs.open("prog", false).unwrap()
}

fn sample_image() -> Vec<u8> {
    let code: Vec<u8> = (0..100u32).flat_map(|i| i.to_le_bytes()).collect();
    let data = b"initialized data".to_vec();
    ElfBuilder::new()
        .entry(0x40)
        .code(0, &code)
        .data(PAGE_SIZE as u32, &data)
        .bss(2 * PAGE_SIZE as u32, 2 * PAGE_SIZE as u32)
        .build()
}

#[test]
fn parses_sections_and_layout() {
    let elf = Elf::new(open_image(sample_image())).unwrap();
    assert_eq!(elf.entry_point(), 0x40);

    // .text, .data, .bss, .shstrtab; the null section is skipped.
    assert_eq!(elf.num_sections(), 4);

    let text = elf.section(0);
    assert_eq!(text.name, ".text");
    assert!(text.loadable());
    assert!(text.read_only());
    assert!(text.flags.contains(SectionFlags::EXECINSTR));
    assert_eq!(text.first_vpn, 0);
    assert_eq!(text.num_pages, 1);

    let data = elf.section(1);
    assert_eq!(data.name, ".data");
    assert!(data.loadable());
    assert!(!data.read_only());
    assert_eq!(data.first_vpn, 1);
    assert_eq!(data.num_pages, 1);

    let bss = elf.section(2);
    assert_eq!(bss.name, ".bss");
    assert!(bss.loadable());
    assert_eq!(bss.first_vpn, 2);
    assert_eq!(bss.num_pages, 2);

    let strtab = elf.section(3);
    assert_eq!(strtab.name, ".shstrtab");
    assert!(!strtab.loadable());
    assert_eq!(strtab.num_pages, 0);

    let load = elf.program_entry_for_type(ProgramType::Load).unwrap();
    assert_eq!(load.vaddr, 0);
    assert_eq!(load.memsz as usize, 4 * PAGE_SIZE);
}

#[test]
fn load_page_copies_and_zero_fills() {
    let mut elf = Elf::new(open_image(sample_image())).unwrap();
    let memory = PhysMemory::new(4);

    // Dirty the target frame first so the zero fill is observable.
    memory.write_page(3, &vec![0xAA; PAGE_SIZE]);
    elf.load_page(1, 0, 3, &memory).unwrap();
    let frame = memory.read_page(3);
    assert_eq!(&frame[..16], b"initialized data");
    assert!(frame[16..].iter().all(|&b| b == 0));

    // NOBITS pages zero-fill the whole frame.
    memory.write_page(2, &vec![0x55; PAGE_SIZE]);
    elf.load_page(2, 1, 2, &memory).unwrap();
    assert!(memory.read_page(2).iter().all(|&b| b == 0));
}

#[test]
fn exact_page_multiple_fills_last_page_fully() {
    let body: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 255) as u8 | 1).collect();
    let image = ElfBuilder::new().code(0, &body).build();
    let mut elf = Elf::new(open_image(image)).unwrap();
    assert_eq!(elf.section(0).num_pages, 2);

    let memory = PhysMemory::new(2);
    elf.load_page(0, 1, 0, &memory).unwrap();
    let frame = memory.read_page(0);
    // Every byte of the final page comes from the file; none are zero.
    assert_eq!(frame, body[PAGE_SIZE..]);
    assert!(frame.iter().all(|&b| b != 0));
}

#[test]
fn rejects_malformed_headers() {
    let good = sample_image();

    let mut bad_magic = good.clone();
    bad_magic[1] = b'X';
    assert!(matches!(
        Elf::new(open_image(bad_magic)),
        Err(ElfError::BadFormat(_))
    ));

    let mut bad_class = good.clone();
    bad_class[4] = 2; // 64-bit
    assert!(matches!(
        Elf::new(open_image(bad_class)),
        Err(ElfError::BadFormat(_))
    ));

    let mut big_endian = good.clone();
    big_endian[5] = 2;
    assert!(matches!(
        Elf::new(open_image(big_endian)),
        Err(ElfError::BadFormat(_))
    ));

    let mut relocatable = good.clone();
    relocatable[16] = 1; // ET_REL
    relocatable[17] = 0;
    assert!(matches!(
        Elf::new(open_image(relocatable)),
        Err(ElfError::BadFormat(_))
    ));

    let truncated = good[..32].to_vec();
    assert!(matches!(
        Elf::new(open_image(truncated)),
        Err(ElfError::BadFormat(_))
    ));
}

#[test]
fn images_agree_with_independent_parser() {
    let image = sample_image();
    let parsed = goblin::elf::Elf::parse(&image).expect("goblin rejected the image");

    assert!(!parsed.is_64);
    assert!(parsed.little_endian);
    assert_eq!(parsed.header.e_entry, 0x40);
    assert_eq!(parsed.header.e_type, goblin::elf::header::ET_EXEC);

    // goblin sees the null section too.
    assert_eq!(parsed.section_headers.len(), 5);
    let names: Vec<&str> = parsed
        .section_headers
        .iter()
        .skip(1)
        .map(|sh| parsed.shdr_strtab.get_at(sh.sh_name).unwrap())
        .collect();
    assert_eq!(names, [".text", ".data", ".bss", ".shstrtab"]);

    let ours = Elf::new(open_image(image.clone())).unwrap();
    for (sh, section) in parsed.section_headers.iter().skip(1).zip(ours.sections()) {
        assert_eq!(sh.sh_addr, section.addr as u64);
        assert_eq!(sh.sh_size, section.size as u64);
        assert_eq!(sh.sh_offset, section.offset as u64);
    }

    let load = parsed
        .program_headers
        .iter()
        .find(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD)
        .unwrap();
    assert_eq!(
        load.p_memsz,
        ours.program_entry_for_type(ProgramType::Load).unwrap().memsz as u64
    );
}
